// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use flacpack::Error;
use flacpack::decode::Decoder;
use flacpack::encode::{Encoder, Options};
use flacpack::metadata::Block;
use std::io::Cursor;

fn noise(samples: usize, seed: u64) -> Vec<i32> {
    fastrand::seed(seed);
    (0..samples).map(|_| fastrand::i32(-20000..20000)).collect()
}

fn roundtrip(block_size: u16, samples: usize) {
    let left = noise(samples, u64::from(block_size));
    let right = noise(samples, u64::from(block_size) + 1);

    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        Options::default().block_size(block_size).unwrap(),
        44100,
        16,
        2,
        Some(samples as u64),
    )
    .unwrap();
    encoder.write(&[left.as_slice(), right.as_slice()]).unwrap();
    encoder.finish().unwrap();

    flac.set_position(0);
    let mut decoder = Decoder::new(flac).unwrap();
    let mut decoded = [Vec::new(), Vec::new()];
    while let Some(frame) = decoder.read_frame().unwrap() {
        decoded[0].extend_from_slice(frame.channel(0));
        decoded[1].extend_from_slice(frame.channel(1));
    }

    assert_eq!(decoded[0], left);
    assert_eq!(decoded[1], right);
}

#[test]
fn test_fractional_final_blocks() {
    for samples in [31, 32, 33, 34, 35, 2046, 2047, 2048, 2049, 2050] {
        roundtrip(33, samples);
    }

    for samples in [254, 255, 256, 257, 258, 511, 512, 513] {
        roundtrip(256, samples);
    }

    for samples in [2047, 2048, 2049, 4095, 4096, 4097] {
        roundtrip(2048, samples);
    }
}

#[test]
fn test_bad_magic() {
    let samples = noise(1000, 1);

    let mut flac = Cursor::new(vec![]);
    let mut encoder =
        Encoder::new(&mut flac, Options::default(), 44100, 16, 1, Some(1000)).unwrap();
    encoder.write(&[&samples]).unwrap();
    encoder.finish().unwrap();

    let mut bytes = flac.into_inner();
    bytes[3] = b'D'; // "fLaD"

    assert!(matches!(
        Decoder::new(Cursor::new(bytes)),
        Err(Error::MissingFlacTag),
    ));
}

#[test]
fn test_truncated_stream() {
    let samples = noise(8192, 2);

    let mut flac = Cursor::new(vec![]);
    let mut encoder =
        Encoder::new(&mut flac, Options::default(), 44100, 16, 1, Some(8192)).unwrap();
    encoder.write(&[&samples]).unwrap();
    encoder.finish().unwrap();

    let mut bytes = flac.into_inner();
    bytes.truncate(bytes.len() - 100);

    let mut decoder = Decoder::new(Cursor::new(bytes)).unwrap();
    let mut result = Ok(());
    loop {
        match decoder.read_frame() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    assert!(result.is_err());
}

#[test]
fn test_unknown_blocks_carried_verbatim() {
    let samples = noise(1000, 3);

    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        Options::default()
            .raw_block(4, vec![1, 2, 3, 4, 5]) // a comment-shaped block
            .unwrap()
            .raw_block(2, vec![0xAA; 64])
            .unwrap(),
        44100,
        16,
        1,
        Some(1000),
    )
    .unwrap();
    encoder.write(&[&samples]).unwrap();
    encoder.finish().unwrap();

    flac.set_position(0);
    let decoder = Decoder::new(flac).unwrap();

    let unknown: Vec<(u8, &[u8])> = decoder
        .blocks()
        .iter()
        .filter_map(|block| match block {
            Block::Unknown(unknown) => Some((unknown.block_type, unknown.data.as_slice())),
            _ => None,
        })
        .collect();

    assert_eq!(
        unknown,
        vec![(4u8, &[1u8, 2, 3, 4, 5][..]), (2u8, &[0xAA; 64][..])],
    );
}

#[test]
fn test_streaminfo_frame_sizes() {
    let samples = noise(20000, 4);

    let mut flac = Cursor::new(vec![]);
    let mut encoder =
        Encoder::new(&mut flac, Options::default(), 44100, 16, 1, Some(20000)).unwrap();
    encoder.write(&[&samples]).unwrap();
    let streaminfo = encoder.finish().unwrap();

    let min = streaminfo.minimum_frame_size.unwrap().get() as u64;
    let max = streaminfo.maximum_frame_size.unwrap().get() as u64;
    assert!(min <= max);

    // every encoded frame must sit within the advertised range
    flac.set_position(0);
    let total = flac.get_ref().len() as u64;
    assert!(max < total);
}

#[test]
fn test_sample_count_must_match_total() {
    let samples = noise(1000, 5);

    let mut flac = Cursor::new(vec![]);
    let mut encoder =
        Encoder::new(&mut flac, Options::default(), 44100, 16, 1, Some(2000)).unwrap();
    encoder.write(&[&samples]).unwrap();

    assert!(matches!(
        encoder.finish(),
        Err(Error::SampleCountMismatch),
    ));
}

#[test]
fn test_excess_samples_rejected() {
    let samples = noise(3000, 6);

    let mut flac = Cursor::new(vec![]);
    let mut encoder =
        Encoder::new(&mut flac, Options::default(), 44100, 16, 1, Some(1000)).unwrap();

    // 3000 samples sit buffered until the final flush discovers
    // they exceed the indicated total of 1000
    encoder.write(&[&samples]).unwrap();
    assert!(matches!(
        encoder.finish(),
        Err(Error::ExcessiveTotalSamples),
    ));
}

#[test]
fn test_invalid_parameters_rejected() {
    fn encoder(
        sample_rate: u32,
        bits_per_sample: u32,
        channels: u8,
    ) -> Result<Encoder<Cursor<Vec<u8>>>, Error> {
        Encoder::new(
            Cursor::new(vec![]),
            Options::default(),
            sample_rate,
            bits_per_sample,
            channels,
            None,
        )
    }

    assert!(matches!(
        encoder(0, 16, 1),
        Err(Error::InvalidSampleRate),
    ));
    assert!(matches!(
        encoder(655351, 16, 1),
        Err(Error::InvalidSampleRate),
    ));
    assert!(matches!(
        encoder(44100, 3, 1),
        Err(Error::InvalidBitsPerSample),
    ));
    assert!(matches!(
        encoder(44100, 33, 1),
        Err(Error::InvalidBitsPerSample),
    ));
    assert!(matches!(
        encoder(44100, 16, 0),
        Err(Error::ExcessiveChannels),
    ));
    assert!(matches!(
        encoder(44100, 16, 9),
        Err(Error::ExcessiveChannels),
    ));
    assert!(matches!(
        Options::default().block_size(0),
        Err(Error::InvalidBlockSize),
    ));
    assert!(matches!(
        Options::default().max_rice_order(16),
        Err(Error::InvalidRiceOrder),
    ));
    assert!(matches!(
        Options::default().lpc_round_variables(31),
        Err(Error::InvalidRoundVariables),
    ));
}
