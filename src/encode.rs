// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding PCM samples to FLAC streams

use crate::audio::SampleMd5;
use crate::crc::{Crc16, CrcWriter};
use crate::metadata::{Block, SeekPoint, SeekTable, Streaminfo, UnknownBlock, write_blocks};
use crate::stream::{
    ChannelAssignment, FIXED_COEFFICIENTS, FrameHeader, FrameNumber, ResidualMethod,
    ResidualPartitionHeader, SubframeHeader, SubframeHeaderType, signed_width,
};
use crate::{Counter, Error};
use arrayvec::ArrayVec;
use bitstream_io::{BigEndian, BitWrite, BitWriter, SignedBitCount};
use std::num::NonZero;

const MAX_CHANNELS: usize = 8;

/// How hard the encoder searches for the smallest representation
///
/// The subset modes stay within the FLAC streamable subset;
/// the lax modes trade conformance with subset decoders for
/// wider prediction searches.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Fixed prediction orders 0-4 only
    SubsetOnlyFixed,
    /// Fixed orders 0-1 and LPC orders 2-12
    SubsetBest,
    /// Fixed orders 0-1 and LPC orders 2-22
    LaxMedium,
    /// Fixed orders 0-1 and LPC orders 2-32
    LaxBest,
}

#[derive(Copy, Clone, Debug)]
struct SearchBounds {
    // inclusive range of fixed prediction orders, if any
    fixed_orders: Option<(usize, usize)>,
    // inclusive range of LPC orders, if any
    lpc_orders: Option<(usize, usize)>,
    // how many worst-rounded LPC coefficients to
    // explore floor/ceil variants of
    round_variables: u32,
    // maximum Rice partition order
    max_rice_order: u32,
}

impl SearchMode {
    fn bounds(self) -> SearchBounds {
        match self {
            Self::SubsetOnlyFixed => SearchBounds {
                fixed_orders: Some((0, 4)),
                lpc_orders: None,
                round_variables: 0,
                max_rice_order: 8,
            },
            Self::SubsetBest => SearchBounds {
                fixed_orders: Some((0, 1)),
                lpc_orders: Some((2, 12)),
                round_variables: 0,
                max_rice_order: 8,
            },
            Self::LaxMedium => SearchBounds {
                fixed_orders: Some((0, 1)),
                lpc_orders: Some((2, 22)),
                round_variables: 0,
                max_rice_order: 15,
            },
            Self::LaxBest => SearchBounds {
                fixed_orders: Some((0, 1)),
                lpc_orders: Some((2, 32)),
                round_variables: 0,
                max_rice_order: 15,
            },
        }
    }
}

/// FLAC encoding options
#[derive(Clone, Debug)]
pub struct Options {
    block_size: u16,
    search: SearchMode,
    max_rice_order: Option<u32>,
    round_variables: Option<u32>,
    compute_md5: bool,
    seekpoint_interval: Option<u64>,
    extra_blocks: Vec<UnknownBlock>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: 4096,
            search: SearchMode::SubsetBest,
            max_rice_order: None,
            round_variables: None,
            compute_md5: true,
            seekpoint_interval: None,
            extra_blocks: Vec::new(),
        }
    }
}

impl Options {
    /// Sets a new block size, in samples
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is 0.
    pub fn block_size(self, block_size: u16) -> Result<Self, Error> {
        match block_size {
            0 => Err(Error::InvalidBlockSize),
            block_size => Ok(Self { block_size, ..self }),
        }
    }

    /// Sets a new search mode
    pub fn search(self, search: SearchMode) -> Self {
        Self { search, ..self }
    }

    /// Overrides the search mode's maximum Rice partition order
    ///
    /// # Errors
    ///
    /// Returns an error if the order is beyond 15.
    pub fn max_rice_order(self, max_rice_order: u32) -> Result<Self, Error> {
        match max_rice_order {
            0..=15 => Ok(Self {
                max_rice_order: Some(max_rice_order),
                ..self
            }),
            _ => Err(Error::InvalidRiceOrder),
        }
    }

    /// Overrides how many worst-rounded LPC coefficients to explore
    /// floor/ceil combinations of
    ///
    /// # Errors
    ///
    /// Returns an error if the count is beyond 30.
    pub fn lpc_round_variables(self, round_variables: u32) -> Result<Self, Error> {
        match round_variables {
            0..=30 => Ok(Self {
                round_variables: Some(round_variables),
                ..self
            }),
            _ => Err(Error::InvalidRoundVariables),
        }
    }

    /// Whether to compute the whole-stream MD5 hash
    ///
    /// Defaults to `true`.  When disabled, or when the bit depth
    /// isn't a whole number of bytes, the STREAMINFO hash field
    /// is left all zero to signal "not computed".
    pub fn md5(self, compute_md5: bool) -> Self {
        Self {
            compute_md5,
            ..self
        }
    }

    /// Generates a SEEKTABLE with the given number of samples
    /// between seek points
    ///
    /// The table can only be generated when the total sample count
    /// is known up front; otherwise no table is written.
    pub fn seekpoint_interval(self, samples: u64) -> Self {
        Self {
            seekpoint_interval: (samples > 0).then_some(samples),
            ..self
        }
    }

    /// Adds a metadata block carried through verbatim
    ///
    /// # Errors
    ///
    /// Returns an error unless the block type is between 1 and 126.
    pub fn raw_block(mut self, block_type: u8, data: Vec<u8>) -> Result<Self, Error> {
        match block_type {
            1..=126 if block_type != 3 => {
                self.extra_blocks.push(UnknownBlock { block_type, data });
                Ok(self)
            }
            _ => Err(Error::InvalidMetadataBlock),
        }
    }

    fn bounds(&self) -> SearchBounds {
        let mut bounds = self.search.bounds();
        if let Some(max_rice_order) = self.max_rice_order {
            bounds.max_rice_order = max_rice_order;
        }
        if let Some(round_variables) = self.round_variables {
            bounds.round_variables = round_variables;
        }
        bounds
    }
}

/// A FLAC encoder which accepts samples as planar channels
///
/// Samples accumulate across calls to [`Encoder::write`] and are
/// cut into fixed-size blocks, each encoded as one FLAC frame.
/// [`Encoder::finish`] flushes the final short block and rewrites
/// the stream's metadata with the final values, which is why the
/// sink must be seekable.
pub struct Encoder<W: std::io::Write + std::io::Seek> {
    // counts bytes from the start of the first frame
    writer: Counter<W>,
    // all metadata blocks, rewritten with final values on finish
    blocks: Vec<Block>,
    streaminfo: Streaminfo,
    bounds: SearchBounds,
    block_size: usize,
    seekpoint_interval: Option<u64>,
    // buffered input samples, one buffer per channel
    pending: Vec<Vec<i64>>,
    // the block currently being encoded, one buffer per channel
    block: Vec<Vec<i64>>,
    stereo: StereoBuffers,
    scratch: SubframeScratch,
    frame_number: u64,
    samples_written: u64,
    // the first byte and starting sample of every encoded frame
    seekpoints: Vec<SeekPoint>,
    md5: Option<SampleMd5>,
    finalized: bool,
}

impl<W: std::io::Write + std::io::Seek> Encoder<W> {
    /// Creates a new FLAC encoder with the given parameters
    ///
    /// The writer should be positioned at the start of the file.
    ///
    /// `sample_rate` must be between 1 and 655,350 Hz.
    ///
    /// `bits_per_sample` must be between 4 and 32.
    ///
    /// `channels` must be between 1 and 8.
    ///
    /// `total_samples`, if known, must be between 1 and 2³⁶ - 1;
    /// the number of channel-independent samples written must then
    /// equal that amount by the time the stream is finished.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if unable to write the initial metadata
    /// blocks, or an error if any encoding parameter is invalid.
    pub fn new(
        mut writer: W,
        options: Options,
        sample_rate: u32,
        bits_per_sample: impl TryInto<SignedBitCount<32>>,
        channels: u8,
        total_samples: Option<u64>,
    ) -> Result<Self, Error> {
        let streaminfo = Streaminfo {
            minimum_block_size: options.block_size,
            maximum_block_size: options.block_size,
            minimum_frame_size: None,
            maximum_frame_size: None,
            sample_rate: (1..=Streaminfo::MAX_SAMPLE_RATE)
                .contains(&sample_rate)
                .then_some(sample_rate)
                .ok_or(Error::InvalidSampleRate)?,
            bits_per_sample: bits_per_sample
                .try_into()
                .ok()
                .filter(|bps| u32::from(*bps) >= 4)
                .ok_or(Error::InvalidBitsPerSample)?,
            channels: NonZero::new(channels)
                .filter(|channels| *channels <= Streaminfo::MAX_CHANNELS)
                .ok_or(Error::ExcessiveChannels)?,
            total_samples: match total_samples {
                None => None,
                Some(0) => return Err(Error::NoSamples),
                Some(total) if total <= Streaminfo::MAX_TOTAL_SAMPLES => NonZero::new(total),
                Some(_) => return Err(Error::ExcessiveTotalSamples),
            },
            md5: None,
        };

        let mut blocks = vec![Block::Streaminfo(streaminfo.clone())];

        // a placeholder SEEKTABLE, populated with real points on finish
        if let (Some(interval), Some(total)) =
            (options.seekpoint_interval, streaminfo.total_samples)
        {
            blocks.push(Block::SeekTable(SeekTable {
                points: vec![
                    SeekPoint::PLACEHOLDER;
                    total
                        .get()
                        .div_ceil(interval)
                        .min(total.get().div_ceil(u64::from(options.block_size)))
                        .try_into()
                        .unwrap_or(usize::MAX)
                ],
            }));
        }

        blocks.extend(options.extra_blocks.iter().cloned().map(Block::Unknown));

        write_blocks(writer.by_ref(), &blocks)?;

        let channel_count = usize::from(streaminfo.channels.get());

        Ok(Self {
            writer: Counter::new(writer),
            md5: options
                .compute_md5
                .then(|| SampleMd5::new(streaminfo.bits_per_sample()))
                .flatten(),
            bounds: options.bounds(),
            block_size: usize::from(options.block_size),
            seekpoint_interval: options.seekpoint_interval,
            pending: vec![Vec::new(); channel_count],
            block: vec![Vec::new(); channel_count],
            stereo: StereoBuffers::default(),
            scratch: SubframeScratch::default(),
            frame_number: 0,
            samples_written: 0,
            seekpoints: Vec::new(),
            finalized: false,
            streaminfo,
            blocks,
        })
    }

    /// Appends samples to the stream, one slice per channel
    ///
    /// All channels must be the same length, though that length is
    /// arbitrary; whole blocks are encoded as they fill up.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel count or lengths are
    /// inconsistent, if more samples arrive than the indicated
    /// total, or if an I/O error occurs writing frames.
    pub fn write(&mut self, channels: &[&[i32]]) -> Result<(), Error> {
        if channels.len() != usize::from(self.streaminfo.channels.get()) {
            return Err(Error::ChannelsMismatch);
        }
        if channels
            .iter()
            .any(|channel| channel.len() != channels[0].len())
        {
            return Err(Error::ChannelLengthMismatch);
        }

        for (pending, channel) in self.pending.iter_mut().zip(channels) {
            pending.extend(channel.iter().copied().map(i64::from));
        }

        while self.pending[0].len() >= self.block_size {
            self.encode_next_block(self.block_size)?;
        }

        Ok(())
    }

    fn encode_next_block(&mut self, block_size: usize) -> Result<(), Error> {
        for (block, pending) in self.block.iter_mut().zip(self.pending.iter_mut()) {
            block.clear();
            block.extend(pending.drain(0..block_size));
        }

        if let Some(md5) = self.md5.as_mut() {
            let block = &self.block;
            md5.update(
                (0..block_size).flat_map(|i| block.iter().map(move |channel| channel[i] as i32)),
            );
        }

        self.seekpoints.push(SeekPoint {
            sample_offset: Some(self.samples_written),
            byte_offset: self.writer.count,
            frame_samples: block_size as u16,
        });

        self.samples_written += block_size as u64;
        if let Some(total) = self.streaminfo.total_samples {
            if self.samples_written > total.get() {
                return Err(Error::ExcessiveTotalSamples);
            }
        }

        let channels: ArrayVec<&[i64], MAX_CHANNELS> =
            self.block.iter().map(Vec::as_slice).collect();

        let (assignment, plans) = plan_channels(
            &channels,
            self.streaminfo.bits_per_sample(),
            &self.bounds,
            &mut self.stereo,
            &mut self.scratch,
        )?;

        write_frame(
            &mut self.writer,
            &mut self.streaminfo,
            false,
            self.frame_number,
            assignment,
            &plans,
            &channel_data(assignment, &channels, &self.stereo),
            &mut self.scratch,
        )?;

        self.frame_number += 1;
        Ok(())
    }

    fn finalize_inner(&mut self) -> Result<(), Error> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        // encode any leftover samples into a final short frame
        let remaining = self.pending[0].len();
        if remaining > 0 {
            self.encode_next_block(remaining)?;
        }

        match &mut self.streaminfo.total_samples {
            Some(expected) => {
                if expected.get() != self.samples_written {
                    return Err(Error::SampleCountMismatch);
                }
            }
            expected @ None => {
                if self.samples_written > Streaminfo::MAX_TOTAL_SAMPLES {
                    return Err(Error::ExcessiveTotalSamples);
                }
                *expected = Some(NonZero::new(self.samples_written).ok_or(Error::NoSamples)?);
            }
        }

        self.streaminfo.md5 = self.md5.take().map(SampleMd5::finalize);

        // swap real frame positions into the placeholder SEEKTABLE
        if let Some(interval) = self.seekpoint_interval {
            if let Some(Block::SeekTable(SeekTable { points })) = self
                .blocks
                .iter_mut()
                .find(|block| matches!(block, Block::SeekTable(_)))
            {
                let mut all_points = self.seekpoints.iter();

                points.iter_mut().zip(0u64..).for_each(|(table_point, index)| {
                    if let Some(point) = all_points.find(|point| {
                        point.sample_offset.unwrap_or(0) + u64::from(point.frame_samples)
                            > index * interval
                    }) {
                        *table_point = point.clone();
                    }
                });
            }
        }

        self.blocks[0] = Block::Streaminfo(self.streaminfo.clone());

        let writer = self.writer.stream();
        writer.rewind()?;
        write_blocks(&mut *writer, &self.blocks)
    }

    /// Finishes the stream and returns the final STREAMINFO
    ///
    /// This flushes any partially-filled final block, then seeks
    /// back to the head of the stream and rewrites the metadata
    /// blocks with the final frame sizes, sample total, MD5 hash
    /// and seek points.
    ///
    /// Dropping the encoder finalizes the stream automatically,
    /// but ignores any errors that may occur.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer samples were written than the
    /// indicated total, or if an I/O error occurs.
    pub fn finish(mut self) -> Result<Streaminfo, Error> {
        self.finalize_inner()?;
        Ok(self.streaminfo.clone())
    }
}

impl<W: std::io::Write + std::io::Seek> Drop for Encoder<W> {
    fn drop(&mut self) {
        let _ = self.finalize_inner();
    }
}

const PLAN_BASE: usize = 1024;
const PLAN_MULTIPLES: [usize; 4] = [3, 4, 5, 6];

/// Encodes a complete signal, planning frame boundaries globally
///
/// Candidate frames of 3, 4, 5 and 6 times a 1024-sample base are
/// costed at every base position, then a dynamic program picks the
/// segmentation minimizing the stream's total size.  The resulting
/// stream uses the variable blocking strategy, so its frame headers
/// carry sample offsets rather than frame numbers.
///
/// The options' fixed block size is ignored; everything else
/// applies as in [`Encoder::new`].
///
/// # Errors
///
/// Returns an error if any encoding parameter is invalid, if the
/// channels are empty or of unequal lengths, or if an I/O error
/// occurs.
pub fn encode_planned<W: std::io::Write + std::io::Seek>(
    mut writer: W,
    options: Options,
    sample_rate: u32,
    bits_per_sample: impl TryInto<SignedBitCount<32>>,
    channels: &[&[i32]],
) -> Result<Streaminfo, Error> {
    let total = match channels {
        [] => return Err(Error::ExcessiveChannels),
        [first, rest @ ..] => {
            if rest.iter().any(|channel| channel.len() != first.len()) {
                return Err(Error::ChannelLengthMismatch);
            }
            first.len()
        }
    };
    if total == 0 {
        return Err(Error::NoSamples);
    }
    if total as u64 > Streaminfo::MAX_TOTAL_SAMPLES {
        return Err(Error::ExcessiveTotalSamples);
    }

    let mut streaminfo = Streaminfo {
        minimum_block_size: (PLAN_MULTIPLES[0] * PLAN_BASE) as u16,
        maximum_block_size: (PLAN_MULTIPLES[PLAN_MULTIPLES.len() - 1] * PLAN_BASE) as u16,
        minimum_frame_size: None,
        maximum_frame_size: None,
        sample_rate: (1..=Streaminfo::MAX_SAMPLE_RATE)
            .contains(&sample_rate)
            .then_some(sample_rate)
            .ok_or(Error::InvalidSampleRate)?,
        bits_per_sample: bits_per_sample
            .try_into()
            .ok()
            .filter(|bps| u32::from(*bps) >= 4)
            .ok_or(Error::InvalidBitsPerSample)?,
        channels: u8::try_from(channels.len())
            .ok()
            .and_then(NonZero::new)
            .filter(|channels| *channels <= Streaminfo::MAX_CHANNELS)
            .ok_or(Error::ExcessiveChannels)?,
        total_samples: NonZero::new(total as u64),
        md5: None,
    };

    // the whole signal is in hand, so hash it up front
    if options.compute_md5 {
        if let Some(mut md5) = SampleMd5::new(streaminfo.bits_per_sample()) {
            md5.update((0..total).flat_map(|i| channels.iter().map(move |c| c[i])));
            streaminfo.md5 = Some(md5.finalize());
        }
    }

    let samples: Vec<Vec<i64>> = channels
        .iter()
        .map(|channel| channel.iter().copied().map(i64::from).collect())
        .collect();

    let mut blocks = vec![Block::Streaminfo(streaminfo.clone())];
    if let Some(interval) = options.seekpoint_interval {
        blocks.push(Block::SeekTable(SeekTable {
            points: vec![
                SeekPoint::PLACEHOLDER;
                (total as u64)
                    .div_ceil(interval)
                    .min((total as u64).div_ceil((PLAN_MULTIPLES[0] * PLAN_BASE) as u64))
                    .try_into()
                    .unwrap_or(usize::MAX)
            ],
        }));
    }
    blocks.extend(options.extra_blocks.iter().cloned().map(Block::Unknown));

    write_blocks(writer.by_ref(), &blocks)?;

    let bounds = options.bounds();
    let mut stereo = StereoBuffers::default();
    let mut scratch = SubframeScratch::default();

    // cost candidate frames of every size multiple at every
    // base position
    let positions = total.div_ceil(PLAN_BASE);
    let depth = streaminfo.bits_per_sample();

    let mut candidates: Vec<Vec<FramePlan>> = Vec::with_capacity(PLAN_MULTIPLES.len());
    for multiple in PLAN_MULTIPLES {
        let mut row = Vec::with_capacity(positions);
        for i in 0..positions {
            let position = i * PLAN_BASE;
            let block_size = (multiple * PLAN_BASE).min(total - position);
            let slices: ArrayVec<&[i64], MAX_CHANNELS> = samples
                .iter()
                .map(|channel| &channel[position..position + block_size])
                .collect();

            let (assignment, plans) =
                plan_channels(&slices, depth, &bounds, &mut stereo, &mut scratch)?;

            let subframe_bits: u64 = plans.iter().map(|plan| plan.bits).sum();

            // headers are always whole bytes; measure this one exactly
            let mut header = Counter::new(std::io::sink());
            FrameHeader {
                blocking_strategy: true,
                block_size: block_size as u32,
                sample_rate: streaminfo.sample_rate,
                channel_assignment: assignment,
                bits_per_sample: depth,
                frame_number: FrameNumber(position as u64),
            }
            .write(&mut header, &streaminfo)?;

            let bits = (header.count * 8 + subframe_bits).div_ceil(8) * 8 + 16;

            row.push(FramePlan {
                bits,
                block_size,
                assignment,
                subframes: plans,
            });
        }
        candidates.push(row);
    }

    // dynamic program over base positions for the cheapest
    // segmentation of the whole signal
    let mut best_sizes = vec![u64::MAX; positions];
    let mut best_choice = vec![0usize; positions];
    for i in (0..positions).rev() {
        for (j, multiple) in PLAN_MULTIPLES.iter().enumerate() {
            let mut size = candidates[j][i].bits;
            if i + multiple < positions {
                size += best_sizes[i + multiple];
            }
            if size < best_sizes[i] {
                best_sizes[i] = size;
                best_choice[i] = j;
            }
        }
    }

    // emit the chosen frames
    let mut writer = Counter::new(writer);
    let mut seekpoints = Vec::new();
    let mut emitted_blocks = Vec::new();
    let mut i = 0;
    while i < positions {
        let plan = &candidates[best_choice[i]][i];
        let position = i * PLAN_BASE;
        let slices: ArrayVec<&[i64], MAX_CHANNELS> = samples
            .iter()
            .map(|channel| &channel[position..position + plan.block_size])
            .collect();

        if let [left, right] = slices.as_slice() {
            if !matches!(plan.assignment, ChannelAssignment::Independent(_)) {
                fill_stereo(&mut stereo, left, right);
            }
        }

        seekpoints.push(SeekPoint {
            sample_offset: Some(position as u64),
            byte_offset: writer.count,
            frame_samples: plan.block_size as u16,
        });

        write_frame(
            &mut writer,
            &mut streaminfo,
            true,
            position as u64,
            plan.assignment,
            &plan.subframes,
            &channel_data(plan.assignment, &slices, &stereo),
            &mut scratch,
        )?;

        emitted_blocks.push(plan.block_size);
        i += plan.block_size.div_ceil(PLAN_BASE);
    }

    // the final block may be shorter than the minimum without
    // counting toward it, but the maximum covers every frame
    let counted: &[usize] = match emitted_blocks.as_slice() {
        [counted @ .., _] if !counted.is_empty() => counted,
        all => all,
    };
    streaminfo.minimum_block_size = counted.iter().copied().min().unwrap_or(0) as u16;
    streaminfo.maximum_block_size =
        emitted_blocks.iter().copied().max().unwrap_or(0) as u16;

    if let Some(interval) = options.seekpoint_interval {
        if let Some(Block::SeekTable(SeekTable { points })) = blocks
            .iter_mut()
            .find(|block| matches!(block, Block::SeekTable(_)))
        {
            let mut all_points = seekpoints.iter();
            points.iter_mut().zip(0u64..).for_each(|(table_point, index)| {
                if let Some(point) = all_points.find(|point| {
                    point.sample_offset.unwrap_or(0) + u64::from(point.frame_samples)
                        > index * interval
                }) {
                    *table_point = point.clone();
                }
            });
        }
    }

    blocks[0] = Block::Streaminfo(streaminfo.clone());
    let writer = writer.stream();
    writer.rewind()?;
    write_blocks(&mut *writer, &blocks)?;

    Ok(streaminfo)
}

struct FramePlan {
    // total frame size in bits, including header, padding and CRC-16
    bits: u64,
    block_size: usize,
    assignment: ChannelAssignment,
    subframes: ArrayVec<SizeEstimate, MAX_CHANNELS>,
}

#[derive(Default)]
struct SubframeScratch {
    shifted: Vec<i64>,
    residual: Vec<i64>,
}

#[derive(Default)]
struct StereoBuffers {
    mid: Vec<i64>,
    side: Vec<i64>,
}

fn fill_stereo(stereo: &mut StereoBuffers, left: &[i64], right: &[i64]) {
    stereo.mid.clear();
    stereo
        .mid
        .extend(left.iter().zip(right).map(|(l, r)| (l + r) >> 1));
    stereo.side.clear();
    stereo
        .side
        .extend(left.iter().zip(right).map(|(l, r)| l - r));
}

/// Returns the per-channel data to encode, in subframe order,
/// for the given channel assignment
fn channel_data<'c>(
    assignment: ChannelAssignment,
    channels: &'c [&'c [i64]],
    stereo: &'c StereoBuffers,
) -> ArrayVec<&'c [i64], MAX_CHANNELS> {
    match assignment {
        ChannelAssignment::Independent(_) => channels.iter().copied().collect(),
        ChannelAssignment::LeftSide => [channels[0], stereo.side.as_slice()].into_iter().collect(),
        ChannelAssignment::SideRight => [stereo.side.as_slice(), channels[1]].into_iter().collect(),
        ChannelAssignment::MidSide => [stereo.mid.as_slice(), stereo.side.as_slice()]
            .into_iter()
            .collect(),
    }
}

/// Searches out the cheapest stereo mode and subframe plans
/// for one block
fn plan_channels(
    channels: &[&[i64]],
    bits_per_sample: u32,
    bounds: &SearchBounds,
    stereo: &mut StereoBuffers,
    scratch: &mut SubframeScratch,
) -> Result<(ChannelAssignment, ArrayVec<SizeEstimate, MAX_CHANNELS>), Error> {
    match channels {
        // a 32 bps difference channel would need 33-bit samples,
        // beyond what a subframe may carry losslessly in subset
        // streams, so such frames stay independent
        [left, right] if bits_per_sample < 32 => {
            fill_stereo(stereo, left, right);

            let left_info = best_subframe(left, bits_per_sample, bounds, scratch)?;
            let right_info = best_subframe(right, bits_per_sample, bounds, scratch)?;
            let mid_info = best_subframe(&stereo.mid, bits_per_sample, bounds, scratch)?;
            let side_info = best_subframe(&stereo.side, bits_per_sample + 1, bounds, scratch)?;

            let independent = left_info.bits + right_info.bits;
            let left_side = left_info.bits + side_info.bits;
            let side_right = side_info.bits + right_info.bits;
            let mid_side = mid_info.bits + side_info.bits;
            let minimum = independent.min(left_side).min(side_right).min(mid_side);

            Ok(if independent == minimum {
                (
                    ChannelAssignment::Independent(2),
                    [left_info, right_info].into_iter().collect(),
                )
            } else if left_side == minimum {
                (
                    ChannelAssignment::LeftSide,
                    [left_info, side_info].into_iter().collect(),
                )
            } else if side_right == minimum {
                (
                    ChannelAssignment::SideRight,
                    [side_info, right_info].into_iter().collect(),
                )
            } else {
                (
                    ChannelAssignment::MidSide,
                    [mid_info, side_info].into_iter().collect(),
                )
            })
        }
        channels => Ok((
            ChannelAssignment::Independent(channels.len() as u8),
            channels
                .iter()
                .map(|channel| best_subframe(channel, bits_per_sample, bounds, scratch))
                .collect::<Result<_, _>>()?,
        )),
    }
}

/// Writes one complete frame: header, subframes, padding and CRC-16
///
/// Also folds the frame's byte size into the STREAMINFO running
/// minimum and maximum.
#[allow(clippy::too_many_arguments)]
fn write_frame<W: std::io::Write>(
    writer: &mut Counter<W>,
    streaminfo: &mut Streaminfo,
    blocking_strategy: bool,
    position: u64,
    assignment: ChannelAssignment,
    plans: &[SizeEstimate],
    data: &[&[i64]],
    scratch: &mut SubframeScratch,
) -> Result<(), Error> {
    use std::io::Write;

    let size = Counter::new(writer.by_ref());
    let mut w: CrcWriter<_, Crc16> = CrcWriter::new(size);

    FrameHeader {
        blocking_strategy,
        block_size: data[0].len() as u32,
        sample_rate: streaminfo.sample_rate,
        channel_assignment: assignment,
        bits_per_sample: streaminfo.bits_per_sample(),
        frame_number: FrameNumber(position),
    }
    .write(&mut w, streaminfo)?;

    let mut bw = BitWriter::endian(w, BigEndian);
    for (estimate, channel) in plans.iter().zip(data) {
        write_subframe(&mut bw, &estimate.plan, channel, scratch)?;
    }
    bw.byte_align()?;

    let mut w = bw.into_writer();
    let crc16: u16 = w.checksum().into();
    w.write_all(&crc16.to_be_bytes())?;

    // update minimum and maximum frame size values
    if let s @ Some(size) = u32::try_from(w.into_writer().count)
        .ok()
        .filter(|size| *size < Streaminfo::MAX_FRAME_SIZE)
        .and_then(NonZero::new)
    {
        match &mut streaminfo.minimum_frame_size {
            Some(min_size) => {
                *min_size = size.min(*min_size);
            }
            min_size @ None => {
                *min_size = s;
            }
        }

        match &mut streaminfo.maximum_frame_size {
            Some(max_size) => {
                *max_size = size.max(*max_size);
            }
            max_size @ None => {
                *max_size = s;
            }
        }
    }

    Ok(())
}

/// A subframe plan and its exact size in bits
struct SizeEstimate {
    bits: u64,
    plan: SubframePlan,
}

struct SubframePlan {
    wasted_bps: u32,
    // bits per sample after the wasted-bits shift
    bits_per_sample: u32,
    kind: SubframeKind,
}

enum SubframeKind {
    Constant,
    Verbatim,
    Fixed {
        order: usize,
        rice_order: u32,
    },
    Lpc {
        order: usize,
        precision: u32,
        shift: u32,
        coefficients: ArrayVec<i32, 32>,
        rice_order: u32,
    },
}

/// Finds the subframe strategy with the smallest exact bit cost
/// for one channel of one block
fn best_subframe(
    data: &[i64],
    bits_per_sample: u32,
    bounds: &SearchBounds,
    scratch: &mut SubframeScratch,
) -> Result<SizeEstimate, Error> {
    debug_assert!(!data.is_empty());

    // constant blocks collapse to a single sample
    if data.iter().all(|sample| *sample == data[0]) {
        return Ok(SizeEstimate {
            bits: u64::from(1 + 6 + 1 + bits_per_sample),
            plan: SubframePlan {
                wasted_bps: 0,
                bits_per_sample,
                kind: SubframeKind::Constant,
            },
        });
    }

    let wasted_bps = data
        .iter()
        .fold(0, |accumulator, sample| accumulator | *sample)
        .trailing_zeros();
    let bits_per_sample = bits_per_sample - wasted_bps;
    let header_bits = u64::from(1 + 6 + 1 + wasted_bps);

    let SubframeScratch { shifted, residual } = scratch;
    shifted.clear();
    shifted.extend(data.iter().map(|sample| sample >> wasted_bps));

    // verbatim is the fallback every prediction must beat
    let mut best = SizeEstimate {
        bits: header_bits + data.len() as u64 * u64::from(bits_per_sample),
        plan: SubframePlan {
            wasted_bps,
            bits_per_sample,
            kind: SubframeKind::Verbatim,
        },
    };

    if let Some((min_order, max_order)) = bounds.fixed_orders {
        for order in min_order..=max_order {
            if order > shifted.len() {
                break;
            }
            residual.clear();
            residual.extend_from_slice(shifted);
            apply_prediction(residual, FIXED_COEFFICIENTS[order], 0);

            let (rice_bits, rice_order) =
                best_rice_size(residual, order, bounds.max_rice_order);
            let bits =
                header_bits + order as u64 * u64::from(bits_per_sample) + rice_bits;

            if bits < best.bits {
                best = SizeEstimate {
                    bits,
                    plan: SubframePlan {
                        wasted_bps,
                        bits_per_sample,
                        kind: SubframeKind::Fixed { order, rice_order },
                    },
                };
            }
        }
    }

    if let Some((min_order, max_order)) = bounds.lpc_orders {
        if data.len() > 1 {
            let dot = FastDotProduct::new(data, max_order.min(data.len() - 1).min(32));

            for order in min_order..=max_order {
                if order >= data.len() {
                    break;
                }

                let real = lpc_coefficients(data, order, &dot);

                let max_coefficient = real
                    .iter()
                    .fold(0.0f64, |max, coefficient| max.max(coefficient.abs()));
                let whole_bits = match max_coefficient >= 1.0 {
                    true => max_coefficient.log2() as i32 + 1,
                    false => 0,
                };

                const PRECISION: u32 = 15;
                let shift = (PRECISION as i32 - 1 - whole_bits).clamp(0, 15) as u32;
                let scaler = (1i64 << shift) as f64;

                let mut coefficients: ArrayVec<i32, 32> = real
                    .iter()
                    .rev()
                    .map(|coefficient| quantize_coefficient((coefficient * scaler).round()))
                    .collect();

                // the coefficients with the largest rounding residue,
                // worst first, for the floor/ceil variant search
                let round_variables = bounds.round_variables.min(order as u32) as usize;
                let mut worst: Vec<usize> = (0..order).collect();
                if round_variables > 0 {
                    worst.sort_by(|x, y| {
                        let residue = |i: &usize| {
                            let scaled = real[*i] * scaler;
                            (scaled.round() - scaled).abs()
                        };
                        residue(y).total_cmp(&residue(x))
                    });
                }

                let mut best_lpc: Option<(u64, ArrayVec<i32, 32>, u32)> = None;
                for variant in 0..(1u32 << round_variables) {
                    for (bit, index) in worst[0..round_variables].iter().enumerate() {
                        let scaled = real[*index] * scaler;
                        coefficients[order - 1 - index] =
                            quantize_coefficient(match (variant >> bit) & 1 {
                                0 => scaled.floor(),
                                _ => scaled.ceil(),
                            });
                    }

                    residual.clear();
                    residual.extend_from_slice(shifted);
                    let widened: ArrayVec<i64, 32> =
                        coefficients.iter().copied().map(i64::from).collect();
                    apply_prediction(residual, &widened, shift);

                    let (rice_bits, rice_order) =
                        best_rice_size(residual, order, bounds.max_rice_order);
                    let bits = header_bits
                        + order as u64 * u64::from(bits_per_sample)
                        + 4
                        + 5
                        + order as u64 * u64::from(PRECISION)
                        + rice_bits;

                    if best_lpc.as_ref().is_none_or(|(best_bits, ..)| bits < *best_bits) {
                        best_lpc = Some((bits, coefficients.clone(), rice_order));
                    }
                }

                if let Some((bits, coefficients, rice_order)) = best_lpc {
                    if bits < best.bits {
                        best = SizeEstimate {
                            bits,
                            plan: SubframePlan {
                                wasted_bps,
                                bits_per_sample,
                                kind: SubframeKind::Lpc {
                                    order,
                                    precision: PRECISION,
                                    shift,
                                    coefficients,
                                    rice_order,
                                },
                            },
                        };
                    }
                }
            }
        }
    }

    Ok(best)
}

fn quantize_coefficient(value: f64) -> i32 {
    const PRECISION: u32 = 15;
    (value as i32).clamp(-(1 << (PRECISION - 1)), (1 << (PRECISION - 1)) - 1)
}

/// Writes one subframe under the given plan
fn write_subframe<W: BitWrite + ?Sized>(
    w: &mut W,
    plan: &SubframePlan,
    data: &[i64],
    scratch: &mut SubframeScratch,
) -> Result<(), Error> {
    let SubframeScratch { shifted, residual } = scratch;
    let width = signed_width(plan.bits_per_sample)?;

    match &plan.kind {
        SubframeKind::Constant => {
            w.build(&SubframeHeader {
                type_: SubframeHeaderType::Constant,
                wasted_bps: plan.wasted_bps,
            })?;
            w.write_signed_counted(width, data[0] >> plan.wasted_bps)?;
        }
        SubframeKind::Verbatim => {
            w.build(&SubframeHeader {
                type_: SubframeHeaderType::Verbatim,
                wasted_bps: plan.wasted_bps,
            })?;
            for sample in data {
                w.write_signed_counted(width, sample >> plan.wasted_bps)?;
            }
        }
        SubframeKind::Fixed { order, rice_order } => {
            w.build(&SubframeHeader {
                type_: SubframeHeaderType::Fixed(FIXED_COEFFICIENTS[*order]),
                wasted_bps: plan.wasted_bps,
            })?;

            shifted.clear();
            shifted.extend(data.iter().map(|sample| sample >> plan.wasted_bps));
            for warmup in &shifted[0..*order] {
                w.write_signed_counted(width, *warmup)?;
            }

            residual.clear();
            residual.extend_from_slice(shifted);
            apply_prediction(residual, FIXED_COEFFICIENTS[*order], 0);
            write_residuals(w, residual, *order, *rice_order)?;
        }
        SubframeKind::Lpc {
            order,
            precision,
            shift,
            coefficients,
            rice_order,
        } => {
            w.build(&SubframeHeader {
                type_: SubframeHeaderType::Lpc(NonZero::new(*order as u8).unwrap()),
                wasted_bps: plan.wasted_bps,
            })?;

            shifted.clear();
            shifted.extend(data.iter().map(|sample| sample >> plan.wasted_bps));
            for warmup in &shifted[0..*order] {
                w.write_signed_counted(width, *warmup)?;
            }

            w.write::<4, u32>(precision - 1)?;
            w.write::<5, i8>(*shift as i8)?;
            let coefficient_width = signed_width(*precision)?;
            for coefficient in coefficients {
                w.write_signed_counted(coefficient_width, i64::from(*coefficient))?;
            }

            residual.clear();
            residual.extend_from_slice(shifted);
            let widened: ArrayVec<i64, 32> =
                coefficients.iter().copied().map(i64::from).collect();
            apply_prediction(residual, &widened, *shift);
            write_residuals(w, residual, *order, *rice_order)?;
        }
    }

    Ok(())
}

/// Turns `data[coefficients.len()..]` into prediction residuals,
/// in place
fn apply_prediction(data: &mut [i64], coefficients: &[i64], shift: u32) {
    for i in (coefficients.len()..data.len()).rev() {
        let sum: i64 = coefficients
            .iter()
            .enumerate()
            .map(|(j, coefficient)| coefficient * data[i - 1 - j])
            .sum();
        data[i] -= sum >> shift;
    }
}

#[inline]
fn zigzag(value: i64) -> u64 {
    match value >= 0 {
        true => (value as u64) << 1,
        false => (((-value) as u64) << 1) - 1,
    }
}

// Bit width of a signed two's complement representation of the value.
#[inline]
fn signed_bits(folded: u64) -> u32 {
    65 - folded.leading_zeros()
}

/// Finds the partition order minimizing the total Rice-coded size
/// of `data[warmup..]`, returning (size in bits, partition order)
///
/// The size includes the 2-bit coding method, the 4-bit partition
/// order, and every partition's parameter and contents.  Partition
/// costs at each order are pairwise sums of the costs one order
/// deeper, so the per-parameter cost table is built once at the
/// deepest valid order and halved from there.
fn best_rice_size(data: &[i64], warmup: usize, max_partition_order: u32) -> (u64, u32) {
    const PARAMS: usize = 15;

    let mut best_size = u64::MAX;
    let mut best_order = 0;

    let mut escape_bits: Vec<u32> = Vec::new();
    let mut bits_at_param: Vec<u64> = Vec::new();

    for order in (0..=max_partition_order).rev() {
        let partition_size = data.len() >> order;
        if (partition_size << order) != data.len() || partition_size < warmup {
            continue;
        }
        let partitions = 1usize << order;

        if escape_bits.is_empty() {
            escape_bits = vec![0; partitions];
            bits_at_param = vec![0; partitions * PARAMS];
            for (i, value) in data.iter().enumerate().skip(warmup) {
                let partition = i / partition_size;
                escape_bits[partition] = escape_bits[partition]
                    .max(signed_bits((value ^ (value >> 63)) as u64));
                let mut folded = zigzag(*value);
                for param in 0..PARAMS {
                    bits_at_param[param + partition * PARAMS] += folded + 1 + param as u64;
                    folded >>= 1;
                }
            }
        } else {
            for i in 0..partitions {
                let j = i << 1;
                escape_bits[i] = escape_bits[j].max(escape_bits[j + 1]);
                for param in 0..PARAMS {
                    bits_at_param[param + i * PARAMS] =
                        bits_at_param[param + j * PARAMS] + bits_at_param[param + (j + 1) * PARAMS];
                }
            }
            escape_bits.truncate(partitions);
            bits_at_param.truncate(partitions * PARAMS);
        }

        let mut size = 2 + 4 + (4u64 << order);
        for (i, escape) in escape_bits.iter().enumerate() {
            let contents = (partition_size - if i == 0 { warmup } else { 0 }) as u64;
            // an escaped partition's width field only holds 5 bits
            let mut minimum = match escape {
                width @ 0..=31 => 5 + u64::from(*width) * contents,
                _ => u64::MAX,
            };
            for param in 0..PARAMS {
                minimum = minimum.min(bits_at_param[param + i * PARAMS]);
            }
            size += minimum;
        }

        if size < best_size {
            best_size = size;
            best_order = order;
        }
    }

    debug_assert!(best_size != u64::MAX);
    (best_size, best_order)
}

/// Finds the cheapest parameter for one partition, which may be
/// the escape to raw fixed-width residuals
fn best_partition_params(partition: &[i64]) -> ResidualPartitionHeader {
    let escape_width = signed_bits(
        partition
            .iter()
            .fold(0u64, |accumulator, value| {
                accumulator | (value ^ (value >> 63)) as u64
            }),
    );

    let mut best = (escape_width <= 31).then_some((
        4 + 5 + partition.len() as u64 * u64::from(escape_width),
        ResidualPartitionHeader::Escaped {
            width: escape_width,
        },
    ));

    for rice in 0..=14u32 {
        let size = 4 + partition
            .iter()
            .map(|value| (zigzag(*value) >> rice) + 1 + u64::from(rice))
            .sum::<u64>();
        if best.is_none_or(|(best_size, _)| size < best_size) {
            best = Some((size, ResidualPartitionHeader::Standard { rice }));
        }
    }

    best.unwrap().1
}

/// Writes the coding method, partition order and all partitions
/// of `data[warmup..]`
pub(crate) fn write_residuals<W: BitWrite + ?Sized>(
    w: &mut W,
    data: &[i64],
    warmup: usize,
    partition_order: u32,
) -> Result<(), Error> {
    w.build(&ResidualMethod::FourBit)?;
    w.write::<4, _>(partition_order)?;

    let partition_size = data.len() >> partition_order;
    let mut start = warmup;
    let mut end = partition_size;
    while end <= data.len() {
        let partition = &data[start..end];
        let header = best_partition_params(partition);
        w.build_using(&header, ResidualMethod::FourBit)?;

        match header {
            ResidualPartitionHeader::Standard { rice } => {
                for value in partition {
                    let folded = zigzag(*value);
                    w.write_unary::<1>((folded >> rice) as u32)?;
                    if rice > 0 {
                        w.write_var(rice, folded & ((1 << rice) - 1))?;
                    }
                }
            }
            ResidualPartitionHeader::Escaped { width } => {
                let width = signed_width(width)?;
                for value in partition {
                    w.write_signed_counted(width, *value)?;
                }
            }
        }

        start = end;
        end += partition_size;
    }

    Ok(())
}

/// A cache of windowed dot products over one channel's samples
///
/// The autocorrelation matrix needs dot products of the signal
/// against itself at small lags over almost-whole windows; each is
/// the whole-signal product at that lag minus the clipped endpoints.
struct FastDotProduct<'d> {
    data: &'d [i64],
    precomputed: ArrayVec<f64, 33>,
}

impl<'d> FastDotProduct<'d> {
    fn new(data: &'d [i64], max_delta: usize) -> Self {
        debug_assert!(max_delta < data.len());

        Self {
            data,
            precomputed: (0..=max_delta)
                .map(|delta| {
                    data[delta..]
                        .iter()
                        .zip(data)
                        .map(|(x, y)| *x as f64 * *y as f64)
                        .sum()
                })
                .collect(),
        }
    }

    fn dot_product(&self, offset0: usize, offset1: usize, len: usize) -> f64 {
        let (offset0, offset1) = match offset0 <= offset1 {
            true => (offset0, offset1),
            false => (offset1, offset0),
        };
        let delta = offset1 - offset0;

        let mut result = self.precomputed[delta];
        for i in 0..offset0 {
            result -= self.data[i] as f64 * self.data[i + delta] as f64;
        }
        for i in (offset1 + len)..self.data.len() {
            result -= self.data[i] as f64 * self.data[i - delta] as f64;
        }
        result
    }
}

/// Fits real-valued LPC coefficients of the given order by
/// linear least squares
///
/// The returned coefficients are ordered oldest sample first:
/// `x[i] ≈ Σ real[c] · x[i - order + c]`.
fn lpc_coefficients(data: &[i64], order: usize, dot: &FastDotProduct<'_>) -> Vec<f64> {
    let window = data.len() - order;

    let mut matrix: Vec<Vec<f64>> = (0..order)
        .map(|row| {
            (0..=order)
                .map(|column| dot.dot_product(row, column, window))
                .collect()
        })
        .collect();

    solve_matrix(&mut matrix)
}

// Gauss-Jordan elimination over an augmented matrix in place.
fn solve_matrix(matrix: &mut [Vec<f64>]) -> Vec<f64> {
    let rows = matrix.len();
    let columns = rows + 1;

    // forward elimination
    let mut pivots = 0;
    for column in 0..rows {
        if pivots == rows {
            break;
        }
        let Some(pivot_row) = (pivots..rows).find(|row| matrix[*row][column] != 0.0) else {
            continue;
        };
        matrix.swap(pivots, pivot_row);
        let pivot_row = pivots;
        pivots += 1;

        let factor = matrix[pivot_row][column];
        for value in matrix[pivot_row].iter_mut() {
            *value /= factor;
        }
        matrix[pivot_row][column] = 1.0;

        for row in pivot_row + 1..rows {
            let factor = matrix[row][column];
            for k in 0..columns {
                matrix[row][k] -= matrix[pivot_row][k] * factor;
            }
            matrix[row][column] = 0.0;
        }
    }

    // back substitution
    let mut result = vec![0.0; rows];
    for row in (0..pivots).rev() {
        let Some(pivot_column) = (0..columns).find(|column| matrix[row][*column] != 0.0) else {
            continue;
        };
        if pivot_column == columns - 1 {
            continue;
        }
        result[pivot_column] = matrix[row][columns - 1];

        for other in (0..row).rev() {
            let factor = matrix[other][pivot_column];
            for k in 0..columns {
                matrix[other][k] -= matrix[row][k] * factor;
            }
            matrix[other][pivot_column] = 0.0;
        }
    }
    result
}
