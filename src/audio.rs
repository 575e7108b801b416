// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Storage for PCM samples

use std::ops::Index;

/// A decoded set of audio samples
#[derive(Clone, Default, Debug)]
pub struct Frame {
    // all samples, stacked by channel
    samples: Vec<i32>,

    // total number of channels
    channels: usize,

    // total length of each channel in samples
    channel_len: usize,

    // bits-per-sample
    bits_per_sample: u32,

    // sample rate, in Hz
    sample_rate: u32,
}

impl Frame {
    /// Returns channel count
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Returns number of bits per sample
    #[inline]
    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    /// Returns sample rate in Hz
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns PCM frame count, the length of each channel
    #[inline]
    pub fn pcm_frames(&self) -> usize {
        self.channel_len
    }

    /// Returns true if frame is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the given channel's samples
    #[inline]
    pub fn channel(&self, channel: usize) -> &[i32] {
        &self[channel]
    }

    /// Resizes our frame for the given parameters, zeroing its contents
    pub(crate) fn resize_for(
        &mut self,
        sample_rate: u32,
        bits_per_sample: u32,
        channels: usize,
        block_size: usize,
    ) {
        self.sample_rate = sample_rate;
        self.bits_per_sample = bits_per_sample;
        self.channels = channels;
        self.channel_len = block_size;
        self.samples.clear();
        self.samples.resize(channels * block_size, 0);
    }

    /// Returns the given channel's samples for writing
    pub(crate) fn channel_mut(&mut self, channel: usize) -> &mut [i32] {
        &mut self.samples[channel * self.channel_len..(channel + 1) * self.channel_len]
    }

    /// Iterates over all samples in channel-interleaved order
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.samples.len()).map(|i| {
            let (sample, channel) = (i / self.channels, i % self.channels);
            self.samples[channel * self.channel_len + sample]
        })
    }
}

/// Returns given channel's samples
impl Index<usize> for Frame {
    type Output = [i32];

    fn index(&self, index: usize) -> &[i32] {
        &self.samples[index * self.channel_len..(index + 1) * self.channel_len]
    }
}

/// A running MD5 calculation over PCM samples
///
/// FLAC defines the stream hash over the channel-interleaved
/// samples serialized as signed, little-endian values of
/// `bits-per-sample / 8` bytes each, so hashing is only possible
/// when the bit depth is a whole number of bytes.
pub(crate) struct SampleMd5 {
    context: md5::Context,
    bytes_per_sample: usize,
}

impl SampleMd5 {
    /// Returns fresh hasher, or `None` if the bit depth isn't hashable
    pub fn new(bits_per_sample: u32) -> Option<Self> {
        matches!(bits_per_sample, 8 | 16 | 24 | 32).then(|| Self {
            context: md5::Context::new(),
            bytes_per_sample: bits_per_sample as usize / 8,
        })
    }

    /// Updates the hash with samples in channel-interleaved order
    pub fn update(&mut self, samples: impl Iterator<Item = i32>) {
        // the low bytes of the two's complement representation
        // are the sample's little-endian serialization at any depth
        for sample in samples {
            self.context
                .consume(&sample.to_le_bytes()[0..self.bytes_per_sample]);
        }
    }

    /// Returns the final 16-byte digest
    pub fn finalize(self) -> [u8; 16] {
        self.context.compute().0
    }
}
