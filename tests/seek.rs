// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use flacpack::Error;
use flacpack::decode::{Decoder, Md5Status};
use flacpack::encode::{Encoder, Options};
use std::io::Cursor;

const TOTAL: usize = 50000;

fn signal() -> Vec<i32> {
    (0..TOTAL)
        .map(|i| (f64::sin(i as f64 * 0.01) * 10000.0) as i32 + (i % 37) as i32)
        .collect()
}

fn encode(options: Options, samples: &[i32]) -> Vec<u8> {
    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        options,
        44100,
        16,
        1,
        Some(samples.len() as u64),
    )
    .unwrap();
    encoder.write(&[samples]).unwrap();
    encoder.finish().unwrap();
    flac.into_inner()
}

#[test]
fn test_seektable_generated() {
    let samples = signal();
    let flac = encode(
        Options::default().seekpoint_interval(5000),
        &samples,
    );

    let decoder = Decoder::new(Cursor::new(&flac)).unwrap();
    let seektable = decoder.seek_table().expect("SEEKTABLE should be present");

    // all placeholder points were swapped for real frames
    assert!(!seektable.points.is_empty());
    assert!(seektable.points.iter().all(|p| p.sample_offset.is_some()));

    // each point lands at or before its nominal interval target
    for (point, index) in seektable.points.iter().zip(0u64..) {
        let offset = point.sample_offset.unwrap();
        assert!(offset <= index * 5000);
        assert!(offset + u64::from(point.frame_samples) > index * 5000);
    }
}

#[test]
fn test_seek_to_sample() {
    let samples = signal();
    let flac = encode(
        Options::default().seekpoint_interval(5000),
        &samples,
    );

    let mut decoder = Decoder::new(Cursor::new(&flac)).unwrap();

    for target in [0u64, 1, 4095, 4096, 23456, 44100, TOTAL as u64 - 1] {
        let skip = decoder.seek_to_sample(target).unwrap();
        let frame = decoder.read_frame().unwrap().expect("frame at seek target");

        // the target sample sits `skip` samples into this frame
        let frame_start = target - skip;
        let expected = &samples[frame_start as usize..frame_start as usize + frame.pcm_frames()];
        assert_eq!(frame.channel(0), expected);
    }

    // decoding continues normally from a seek target to the end
    let skip = decoder.seek_to_sample(40000).unwrap();
    let mut resumed = Vec::new();
    let mut first = true;
    while let Some(frame) = decoder.read_frame().unwrap() {
        match first {
            true => {
                resumed.extend_from_slice(&frame.channel(0)[skip as usize..]);
                first = false;
            }
            false => resumed.extend_from_slice(frame.channel(0)),
        }
    }
    assert_eq!(resumed, &samples[40000..]);

    // the hash no longer covers the whole stream
    assert_eq!(decoder.md5_status(), Some(Md5Status::Skipped));
}

#[test]
fn test_seek_without_seektable() {
    let samples = signal();
    let flac = encode(Options::default(), &samples);

    let mut decoder = Decoder::new(Cursor::new(&flac)).unwrap();
    assert!(decoder.seek_table().is_none());

    // with no table, seeking decodes forward from the first frame
    let skip = decoder.seek_to_sample(30000).unwrap();
    let frame = decoder.read_frame().unwrap().unwrap();
    let frame_start = (30000 - skip) as usize;
    assert_eq!(
        frame.channel(0),
        &samples[frame_start..frame_start + frame.pcm_frames()],
    );
}

#[test]
fn test_seek_backwards_and_forwards() {
    let samples = signal();
    let flac = encode(
        Options::default().seekpoint_interval(4096),
        &samples,
    );

    let mut decoder = Decoder::new(Cursor::new(&flac)).unwrap();

    for target in [45000u64, 100, 30000, 29999, 0] {
        let skip = decoder.seek_to_sample(target).unwrap();
        let frame = decoder.read_frame().unwrap().unwrap();
        let frame_start = (target - skip) as usize;
        assert_eq!(
            frame.channel(0)[skip as usize],
            samples[frame_start + skip as usize],
        );
    }
}

#[test]
fn test_seek_past_end() {
    let samples = signal();
    let flac = encode(
        Options::default().seekpoint_interval(5000),
        &samples,
    );

    let mut decoder = Decoder::new(Cursor::new(&flac)).unwrap();
    assert!(matches!(
        decoder.seek_to_sample(TOTAL as u64),
        Err(Error::SeekOutOfRange),
    ));
    assert!(matches!(
        decoder.seek_to_sample(u64::MAX),
        Err(Error::SeekOutOfRange),
    ));
}
