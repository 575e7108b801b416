// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use flacpack::decode::{Decoder, Md5Status};
use flacpack::encode::{Encoder, Options, SearchMode, encode_planned};
use std::io::Cursor;

fn encode_all(options: Options, sample_rate: u32, bits_per_sample: u32, channels: &[Vec<i32>]) -> Vec<u8> {
    let mut flac = Cursor::new(vec![]);

    let mut encoder = Encoder::new(
        &mut flac,
        options,
        sample_rate,
        bits_per_sample,
        channels.len() as u8,
        Some(channels[0].len() as u64),
    )
    .unwrap();

    let slices: Vec<&[i32]> = channels.iter().map(Vec::as_slice).collect();
    encoder.write(&slices).unwrap();
    encoder.finish().unwrap();

    flac.into_inner()
}

fn decode_all(bytes: &[u8]) -> (Vec<Vec<i32>>, Option<Md5Status>) {
    let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
    let channel_count = usize::from(decoder.streaminfo().channels.get());

    let mut channels = vec![Vec::new(); channel_count];
    while let Some(frame) = decoder.read_frame().unwrap() {
        for (out, channel) in channels.iter_mut().zip(0..) {
            out.extend_from_slice(frame.channel(channel));
        }
    }

    (channels, decoder.md5_status())
}

// A vaguely musical test signal: a couple of tones plus noise,
// scaled to the given bit depth.
fn signal(samples: usize, bits_per_sample: u32, seed: u64) -> Vec<i32> {
    fastrand::seed(seed);
    let amplitude = (1i64 << (bits_per_sample - 1)) - 1;
    (0..samples)
        .map(|i| {
            let t = i as f64;
            let tone = 0.6 * f64::sin(t * 0.041) + 0.2 * f64::sin(t * 0.0073);
            let noise = (fastrand::f64() - 0.5) * 0.05;
            ((tone + noise) * amplitude as f64 * 0.9) as i32
        })
        .collect()
}

#[test]
fn test_roundtrip_depths_channels_rates() {
    for bits_per_sample in [8, 16, 24] {
        for channel_count in [1, 2, 8] {
            for sample_rate in [8000, 44100, 48000, 96000, 192000] {
                let channels: Vec<Vec<i32>> = (0..channel_count)
                    .map(|channel| signal(4500, bits_per_sample, channel as u64))
                    .collect();

                let flac = encode_all(
                    Options::default(),
                    sample_rate,
                    bits_per_sample,
                    &channels,
                );
                let (decoded, md5) = decode_all(&flac);

                assert_eq!(decoded, channels);
                assert_eq!(md5, Some(Md5Status::Matched));
            }
        }
    }
}

#[test]
fn test_all_search_modes() {
    let channels = vec![signal(10000, 16, 7), signal(10000, 16, 8)];

    for mode in [
        SearchMode::SubsetOnlyFixed,
        SearchMode::SubsetBest,
        SearchMode::LaxMedium,
        SearchMode::LaxBest,
    ] {
        let flac = encode_all(
            Options::default().search(mode),
            44100,
            16,
            &channels,
        );
        let (decoded, md5) = decode_all(&flac);
        assert_eq!(decoded, channels);
        assert_eq!(md5, Some(Md5Status::Matched));
    }
}

#[test]
fn test_lpc_rounding_variants() {
    let channels = vec![signal(8192, 16, 11)];

    let plain = encode_all(Options::default(), 44100, 16, &channels);
    let rounded = encode_all(
        Options::default().lpc_round_variables(3).unwrap(),
        44100,
        16,
        &channels,
    );

    // the variant search may only ever help
    assert!(rounded.len() <= plain.len());
    assert_eq!(decode_all(&rounded).0, channels);
}

#[test]
fn test_constant_mono() {
    let channels = vec![vec![1000; 4096]];
    let flac = encode_all(Options::default(), 44100, 16, &channels);

    // a constant block collapses to a handful of bytes
    assert!(flac.len() < 100);

    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_ramp_mono() {
    let channels = vec![(0..4096).collect::<Vec<i32>>()];
    let flac = encode_all(Options::default(), 44100, 16, &channels);

    // a linear ramp predicts almost perfectly
    assert!(flac.len() < 1024);

    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_stereo_silence_md5() {
    let channels = vec![vec![0; 4096], vec![0; 4096]];
    let flac = encode_all(Options::default(), 44100, 16, &channels);

    // the stored hash covers 4096 interleaved stereo samples of
    // two little-endian bytes each
    let streaminfo = flacpack::metadata::read_info(Cursor::new(&flac)).unwrap();
    assert_eq!(streaminfo.md5, Some(md5::compute(vec![0u8; 16384]).0));

    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_huge_residuals_escape() {
    // spikes of 2³⁰ force at least one Rice partition into the
    // raw-residual escape, which must still round-trip exactly;
    // the low-level noise keeps the wasted-bits shift from
    // swallowing the spikes
    fastrand::seed(17);
    let mut samples: Vec<i32> = (0..8192).map(|_| fastrand::i32(-3..=3)).collect();
    for (i, sample) in samples.iter_mut().enumerate() {
        if i > 0 && i % 512 == 0 {
            *sample = if (i / 512) % 2 == 0 {
                (1 << 30) | 1
            } else {
                -(1 << 30) | 1
            };
        }
    }

    let channels = vec![samples];
    let flac = encode_all(Options::default(), 44100, 32, &channels);
    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_block_size_one() {
    let channels = vec![vec![3, -5, 127]];
    let flac = encode_all(
        Options::default().block_size(1).unwrap(),
        44100,
        8,
        &channels,
    );

    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_md5_can_be_skipped() {
    let channels = vec![signal(4096, 16, 3)];
    let flac = encode_all(Options::default().md5(false), 44100, 16, &channels);

    let streaminfo = flacpack::metadata::read_info(Cursor::new(&flac)).unwrap();
    assert_eq!(streaminfo.md5, None);

    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Skipped));
}

#[test]
fn test_planned_encoding_roundtrip() {
    let channels = vec![
        // a quiet stretch followed by a loud one rewards
        // switching block sizes at the boundary
        (0..20000)
            .map(|i| {
                if i < 10000 {
                    (f64::sin(i as f64 * 0.002) * 100.0) as i32
                } else {
                    (f64::sin(i as f64 * 0.13) * 20000.0) as i32
                }
            })
            .collect::<Vec<i32>>(),
    ];

    let mut flac = Cursor::new(vec![]);
    let streaminfo = encode_planned(
        &mut flac,
        Options::default(),
        44100,
        16,
        &[channels[0].as_slice()],
    )
    .unwrap();

    assert_eq!(
        streaminfo.total_samples.map(std::num::NonZero::get),
        Some(20000),
    );

    let (decoded, md5) = decode_all(&flac.into_inner());
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_planned_encoding_stereo() {
    fastrand::seed(99);
    let right = signal(15000, 16, 99);
    let left: Vec<i32> = right.iter().map(|r| r + fastrand::i32(-3..=3)).collect();
    let channels = vec![left, right];

    let mut flac = Cursor::new(vec![]);
    encode_planned(
        &mut flac,
        Options::default(),
        48000,
        16,
        &[channels[0].as_slice(), channels[1].as_slice()],
    )
    .unwrap();

    let (decoded, md5) = decode_all(&flac.into_inner());
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_reencode_is_byte_identical() {
    // the search is deterministic, so decoding a stream and
    // re-encoding it under the same parameters reproduces the
    // stream byte for byte
    let channels = vec![signal(12000, 16, 21), signal(12000, 16, 22)];

    let first = encode_all(Options::default(), 44100, 16, &channels);
    let (decoded, _) = decode_all(&first);
    let second = encode_all(Options::default(), 44100, 16, &decoded);

    assert_eq!(first, second);
}

#[test]
fn test_32_bps_roundtrip() {
    fastrand::seed(5);
    let channels = vec![
        (0..4096).map(|_| fastrand::i32(..)).collect::<Vec<i32>>(),
        (0..4096).map(|_| fastrand::i32(..)).collect::<Vec<i32>>(),
    ];

    let flac = encode_all(Options::default(), 44100, 32, &channels);
    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Matched));
}

#[test]
fn test_odd_depth_roundtrip() {
    // 12-bit samples have no canonical byte serialization,
    // so the hash is skipped but the samples still round-trip
    let channels = vec![
        (0..4096)
            .map(|i| ((i * 37) % 4000) - 2000)
            .collect::<Vec<i32>>(),
    ];

    let flac = encode_all(Options::default(), 44100, 12, &channels);
    let (decoded, md5) = decode_all(&flac);
    assert_eq!(decoded, channels);
    assert_eq!(md5, Some(Md5Status::Skipped));
}
