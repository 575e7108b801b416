// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For decoding FLAC streams to PCM samples

use crate::audio::{Frame, SampleMd5};
use crate::crc::{Checksum, Crc16, CrcReader};
use crate::metadata::{Block, SeekTable, Streaminfo, read_blocks};
use crate::stream::{
    ChannelAssignment, FrameHeader, ResidualPartitionHeader, SubframeHeader, SubframeHeaderType,
    signed_width,
};
use crate::{Counter, Error};
use arrayvec::ArrayVec;
use bitstream_io::{BigEndian, BitRead, BitReader};
use std::io::Read;

/// The outcome of the decoder's whole-stream MD5 check
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Md5Status {
    /// No hash was stored, the bit depth isn't hashable,
    /// or seeking interrupted the running hash
    Skipped,
    /// The decoded samples hash to the stored value
    Matched,
    /// The decoded samples do not hash to the stored value
    Mismatched,
}

/// A FLAC decoder
pub struct Decoder<R: std::io::Read> {
    reader: Counter<R>,
    streaminfo: Streaminfo,
    seektable: Option<SeekTable>,
    blocks: Vec<Block>,
    // number of bytes from the start of the FLAC data
    // to the first frame
    frames_start: u64,
    frame: Frame,
    // scratch channels wide enough for any intermediate value
    temp0: Vec<i64>,
    temp1: Vec<i64>,
    // sample offset of the next frame
    position: u64,
    // index of the next frame
    next_frame_number: u64,
    // whether the next header's number can be checked against
    // our own counters (false immediately after a seek)
    verify_sequence: bool,
    // the stream's blocking strategy, from its first frame
    blocking_strategy: Option<bool>,
    md5: Option<SampleMd5>,
    md5_status: Option<Md5Status>,
}

impl<R: std::io::Read> Decoder<R> {
    /// Builds a new FLAC decoder from the given stream
    ///
    /// This assumes the stream is positioned at the start of
    /// the FLAC data.  The whole metadata block sequence is
    /// consumed before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial FLAC metadata is invalid
    /// or an I/O error occurs reading it.
    pub fn new(reader: R) -> Result<Self, Error> {
        let mut reader = Counter::new(reader);

        let mut blocks = Vec::new();
        for block in read_blocks(reader.by_ref()) {
            blocks.push(block?);
        }

        let streaminfo = match blocks.first() {
            Some(Block::Streaminfo(streaminfo)) => streaminfo.clone(),
            // read_blocks should check for this already
            // but we'll add a second check to be certain
            _ => return Err(Error::MissingStreaminfo),
        };

        let frames_start = reader.count;
        let scratch_len = usize::from(streaminfo.maximum_block_size);

        Ok(Self {
            seektable: blocks.iter().find_map(|block| match block {
                Block::SeekTable(seektable) => Some(seektable.clone()),
                _ => None,
            }),
            md5: streaminfo
                .md5
                .and_then(|_| SampleMd5::new(streaminfo.bits_per_sample())),
            temp0: vec![0; scratch_len],
            temp1: vec![0; scratch_len],
            frame: Frame::default(),
            position: 0,
            next_frame_number: 0,
            verify_sequence: true,
            blocking_strategy: None,
            md5_status: None,
            reader,
            streaminfo,
            blocks,
            frames_start,
        })
    }

    /// Returns the stream's STREAMINFO block
    #[inline]
    pub fn streaminfo(&self) -> &Streaminfo {
        &self.streaminfo
    }

    /// Returns the stream's SEEKTABLE block, if any
    #[inline]
    pub fn seek_table(&self) -> Option<&SeekTable> {
        self.seektable.as_ref()
    }

    /// Returns all the stream's metadata blocks, in file order
    ///
    /// Block types beyond STREAMINFO and SEEKTABLE are retained
    /// verbatim as [`Block::Unknown`].
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the whole-stream MD5 check outcome
    ///
    /// This is `None` until [`Decoder::read_frame`] has reached the
    /// end of the stream.  An absent or skipped hash is reported as
    /// [`Md5Status::Skipped`] rather than an error so that callers
    /// may accept streams whose encoder didn't compute one.
    #[inline]
    pub fn md5_status(&self) -> Option<Md5Status> {
        self.md5_status
    }

    /// Reads and decodes the next FLAC frame
    ///
    /// Returns `None` at a clean end of stream, at which point the
    /// MD5 of all decoded samples is checked against the STREAMINFO.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs when reading the
    /// stream, or if the stream data is invalid.  No partial frame
    /// is ever delivered; a CRC-16 mismatch discards the whole frame.
    pub fn read_frame(&mut self) -> Result<Option<&Frame>, Error> {
        // probe a single byte so a clean end of stream can be
        // told apart from a truncated frame
        let mut first = [0; 1];
        loop {
            match self.reader.read(&mut first) {
                Ok(0) => {
                    self.end_of_stream();
                    return Ok(None);
                }
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let mut crc16: CrcReader<_, Crc16> =
            CrcReader::new(first.as_slice().chain(self.reader.by_ref()));

        let header = FrameHeader::read(crc16.by_ref(), &self.streaminfo)?;

        match self.blocking_strategy {
            None => self.blocking_strategy = Some(header.blocking_strategy),
            Some(strategy) if strategy != header.blocking_strategy => {
                return Err(Error::BlockingStrategyMismatch);
            }
            Some(_) => {}
        }

        if self.verify_sequence {
            let expected = match header.blocking_strategy {
                true => self.position,
                false => self.next_frame_number,
            };
            if header.frame_number.0 != expected {
                return Err(Error::FrameOutOfSequence);
            }
        } else {
            // adopt the stream's own position after a seek
            self.position = match header.blocking_strategy {
                true => header.frame_number.0,
                false => {
                    header.frame_number.0 * u64::from(self.streaminfo.maximum_block_size)
                }
            };
            self.next_frame_number = header.frame_number.0;
            self.verify_sequence = true;
        }

        let block_size = header.block_size as usize;
        let channels = usize::from(header.channel_assignment.count());
        let depth = header.bits_per_sample;

        self.frame
            .resize_for(header.sample_rate, depth, channels, block_size);

        let temp0 = &mut self.temp0[0..block_size];
        let temp1 = &mut self.temp1[0..block_size];

        let mut r = BitReader::endian(crc16.by_ref(), BigEndian);

        match header.channel_assignment {
            ChannelAssignment::Independent(total) => {
                for channel in 0..usize::from(total) {
                    read_subframe(&mut r, depth, temp0)?;
                    for (out, decoded) in self.frame.channel_mut(channel).iter_mut().zip(&*temp0)
                    {
                        *out = *decoded as i32;
                    }
                }
            }
            assignment => {
                // one of the two channels is a difference channel
                // holding one extra bit
                let (depth0, depth1) = match assignment {
                    ChannelAssignment::SideRight => (depth + 1, depth),
                    _ => (depth, depth + 1),
                };
                read_subframe(&mut r, depth0, temp0)?;
                read_subframe(&mut r, depth1, temp1)?;

                match assignment {
                    ChannelAssignment::LeftSide => {
                        for (left, side) in temp0.iter().zip(temp1.iter_mut()) {
                            *side = left - *side;
                        }
                    }
                    ChannelAssignment::SideRight => {
                        for (side, right) in temp0.iter_mut().zip(&*temp1) {
                            *side += right;
                        }
                    }
                    ChannelAssignment::MidSide => {
                        // the low bit of each mid sample is packed from
                        // the side channel to keep reconstruction exact
                        for (mid, side) in temp0.iter_mut().zip(temp1.iter_mut()) {
                            let s = *side;
                            let m = (*mid << 1) | (s & 1);
                            *mid = (m + s) >> 1;
                            *side = (m - s) >> 1;
                        }
                    }
                    ChannelAssignment::Independent(_) => unreachable!(),
                }

                for (out, decoded) in self.frame.channel_mut(0).iter_mut().zip(&*temp0) {
                    *out = *decoded as i32;
                }
                for (out, decoded) in self.frame.channel_mut(1).iter_mut().zip(&*temp1) {
                    *out = *decoded as i32;
                }
            }
        }

        r.byte_align();
        r.skip(16)?; // CRC-16

        if !crc16.into_checksum().valid() {
            return Err(Error::Crc16Mismatch);
        }

        if let Some(md5) = self.md5.as_mut() {
            md5.update(self.frame.iter());
        }

        self.position += block_size as u64;
        self.next_frame_number += 1;

        Ok(Some(&self.frame))
    }

    fn end_of_stream(&mut self) {
        if self.md5_status.is_none() {
            self.md5_status = Some(match (self.md5.take(), self.streaminfo.md5) {
                (Some(md5), Some(stored)) => match md5.finalize() == stored {
                    true => Md5Status::Matched,
                    false => Md5Status::Mismatched,
                },
                _ => Md5Status::Skipped,
            });
        }
    }
}

impl<R: std::io::Read + std::io::Seek> Decoder<R> {
    /// Repositions the stream at the frame containing the given sample
    ///
    /// The best preceding seek point is taken from the SEEKTABLE when
    /// one is present; otherwise decoding restarts from the first
    /// frame.  The stream is then decoded forward until the frame
    /// containing `sample`, and left positioned so that the next
    /// [`Decoder::read_frame`] returns that frame.
    ///
    /// Returns the number of samples within that frame which precede
    /// `sample`.
    ///
    /// Seeking interrupts the running MD5 calculation, so the final
    /// hash check reports [`Md5Status::Skipped`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeekOutOfRange`] if `sample` is past the end
    /// of the stream, or any error from decoding the intervening
    /// frames.
    pub fn seek_to_sample(&mut self, sample: u64) -> Result<u64, Error> {
        use std::io::SeekFrom;

        if let Some(total) = self.streaminfo.total_samples {
            if sample >= total.get() {
                return Err(Error::SeekOutOfRange);
            }
        }

        // the running hash no longer covers the whole stream
        self.md5 = None;

        let byte_offset = self
            .seektable
            .as_ref()
            .and_then(|seektable| seektable.best_point_for(sample))
            .map(|point| point.byte_offset)
            .unwrap_or(0);

        // seek point byte offsets are relative to the first frame,
        // and our own byte count is relative to the FLAC data,
        // which may itself sit anywhere in the wrapped stream
        let base = self.reader.stream().stream_position()? - self.reader.count;
        let target = self.frames_start + byte_offset;
        self.reader.stream().seek(SeekFrom::Start(base + target))?;
        self.reader.count = target;
        self.verify_sequence = false;

        loop {
            let frame_start = self.reader.count;
            let frame_samples = match self.read_frame()? {
                Some(frame) => frame.pcm_frames() as u64,
                None => return Err(Error::SeekOutOfRange),
            };
            if sample < self.position {
                // rewind so the caller reads this frame next
                let frame_first = self.position - frame_samples;
                self.reader
                    .stream()
                    .seek(SeekFrom::Start(base + frame_start))?;
                self.reader.count = frame_start;
                self.position = frame_first;
                self.next_frame_number -= 1;
                return Ok(sample - frame_first);
            }
        }
    }
}

fn read_subframe<R: BitRead + ?Sized>(
    reader: &mut R,
    bits_per_sample: u32,
    out: &mut [i64],
) -> Result<(), Error> {
    let header: SubframeHeader = reader.parse()?;

    let effective_bps = bits_per_sample
        .checked_sub(header.wasted_bps)
        .filter(|bps| *bps > 0)
        .ok_or(Error::ExcessiveWastedBits)?;

    match header.type_ {
        SubframeHeaderType::Constant => {
            let sample = reader.read_signed_counted(signed_width(effective_bps)?)?;
            out.fill(sample);
        }
        SubframeHeaderType::Verbatim => {
            let width = signed_width(effective_bps)?;
            for sample in out.iter_mut() {
                *sample = reader.read_signed_counted(width)?;
            }
        }
        SubframeHeaderType::Fixed(coefficients) => {
            if coefficients.len() > out.len() {
                return Err(Error::InvalidSubframeHeader);
            }
            let width = signed_width(effective_bps)?;
            for warmup in out[0..coefficients.len()].iter_mut() {
                *warmup = reader.read_signed_counted(width)?;
            }
            read_residuals(reader, coefficients.len(), out)?;
            restore_prediction(out, coefficients, 0);
        }
        SubframeHeaderType::Lpc(order) => {
            let order = usize::from(order.get());
            if order > out.len() {
                return Err(Error::InvalidSubframeHeader);
            }
            let width = signed_width(effective_bps)?;
            for warmup in out[0..order].iter_mut() {
                *warmup = reader.read_signed_counted(width)?;
            }

            let precision = reader.read::<4, u32>()? + 1;
            if precision == 16 {
                return Err(Error::InvalidLpcPrecision);
            }
            let shift: i8 = reader.read::<5, _>()?;
            if shift < 0 {
                return Err(Error::InvalidLpcShift);
            }

            let coefficient_width = signed_width(precision)?;
            let coefficients = (0..order)
                .map(|_| reader.read_signed_counted(coefficient_width))
                .collect::<Result<ArrayVec<i64, 32>, _>>()?;

            read_residuals(reader, order, out)?;
            restore_prediction(out, &coefficients, shift as u32);
        }
    }

    if header.wasted_bps > 0 {
        for sample in out.iter_mut() {
            *sample <<= header.wasted_bps;
        }
    }

    Ok(())
}

/// Reads one residual coding method, partition order and all
/// partitions into `out[warmup..]`
pub(crate) fn read_residuals<R: BitRead + ?Sized>(
    reader: &mut R,
    warmup: usize,
    out: &mut [i64],
) -> Result<(), Error> {
    let block_size = out.len();
    let method = reader.parse()?;
    let partition_order = reader.read::<4, u32>()?;

    let partitions = 1usize << partition_order;
    if block_size % partitions != 0 {
        return Err(Error::InvalidPartitionOrder);
    }
    let partition_size = block_size >> partition_order;
    if partition_size < warmup {
        return Err(Error::InvalidPartitionOrder);
    }

    let mut start = warmup;
    let mut end = partition_size;
    while end <= block_size {
        match reader.parse_using::<ResidualPartitionHeader>(method)? {
            ResidualPartitionHeader::Standard { rice } => {
                // cap on the unary quotient, so that no decoded value
                // can overflow a signed 53-bit range after the
                // prediction is restored
                let unary_limit = 1u64 << (53 - rice);

                for slot in out[start..end].iter_mut() {
                    let quotient = u64::from(reader.read_unary::<1>()?);
                    if quotient >= unary_limit {
                        return Err(Error::ResidualOverflow);
                    }
                    let value = (quotient << rice)
                        | match rice {
                            0 => 0,
                            rice => reader.read_var::<u64>(rice)?,
                        };
                    *slot = ((value >> 1) as i64) ^ -((value & 1) as i64);
                }
            }
            ResidualPartitionHeader::Escaped { width: 0 } => {
                out[start..end].fill(0);
            }
            ResidualPartitionHeader::Escaped { width } => {
                let width = signed_width(width)?;
                for slot in out[start..end].iter_mut() {
                    *slot = reader.read_signed_counted(width)?;
                }
            }
        }
        start = end;
        end += partition_size;
    }

    Ok(())
}

/// Rebuilds `data[coefficients.len()..]` from residuals
/// according to the prediction
///
/// Corrupt residuals can push intermediate values out of the `i64`
/// range; the arithmetic wraps rather than traps, and the resulting
/// garbage frame is rejected by its CRC-16.
fn restore_prediction(data: &mut [i64], coefficients: &[i64], shift: u32) {
    for i in coefficients.len()..data.len() {
        let mut sum: i64 = 0;
        for (j, coefficient) in coefficients.iter().enumerate() {
            sum = sum.wrapping_add(coefficient.wrapping_mul(data[i - 1 - j]));
        }
        data[i] = data[i].wrapping_add(sum >> shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_fixed_orders() {
        // order 1 prediction turns a constant residual into a ramp
        let mut data = [5, 1, 1, 1, 1];
        restore_prediction(&mut data, &[1], 0);
        assert_eq!(data, [5, 6, 7, 8, 9]);

        // order 2 prediction extends a line exactly
        let mut data = [3, 5, 0, 0, 0];
        restore_prediction(&mut data, &[2, -1], 0);
        assert_eq!(data, [3, 5, 7, 9, 11]);
    }

    #[test]
    fn test_restore_with_shift() {
        // quantized coefficient 3 at shift 1 halves the prediction
        let mut data = [4, 0, 0];
        restore_prediction(&mut data, &[3], 1);
        assert_eq!(data, [4, 6, 9]);
    }
}
