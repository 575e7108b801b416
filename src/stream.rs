// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling common FLAC stream items

use crate::Error;
use crate::metadata::Streaminfo;
use bitstream_io::{
    BitRead, BitWrite, FromBitStream, FromBitStreamUsing, FromBitStreamWith, SignedBitCount,
    ToBitStream, ToBitStreamUsing, ToBitStreamWith,
};
use std::io::Read;
use std::num::NonZero;

/// The fixed prediction coefficients, one set per order 0 to 4
pub(crate) const FIXED_COEFFICIENTS: [&[i64]; 5] =
    [&[], &[1], &[2, -1], &[3, -3, 1], &[4, -6, 4, -1]];

/// Converts a runtime bit width to a signed bit count
///
/// Subframe contents may be up to 33 bits wide, one more than the
/// stream's bit depth, when holding a difference channel.
pub(crate) fn signed_width(bits: u32) -> Result<SignedBitCount<33>, Error> {
    bits.try_into().map_err(|_| Error::InvalidBitsPerSample)
}

/// A FLAC frame header
#[derive(Debug)]
pub struct FrameHeader {
    /// The blocking strategy bit
    ///
    /// `false` means fixed block sizes and a frame number,
    /// `true` means variable block sizes and a sample offset.
    pub blocking_strategy: bool,
    /// The block size, in samples, from 1 to 65536
    pub block_size: u32,
    /// The sample rate, in Hz
    pub sample_rate: u32,
    /// How the channels are assigned
    pub channel_assignment: ChannelAssignment,
    /// The number of bits per output sample, from 4 to 32
    pub bits_per_sample: u32,
    /// The frame's number in the stream
    ///
    /// A frame index under the fixed blocking strategy,
    /// or the offset of the frame's first sample under the
    /// variable blocking strategy.
    pub frame_number: FrameNumber,
}

impl FrameHeader {
    const SYNC_CODE: u32 = 0b111111111111100;

    /// Reads a new header from the given reader and
    /// validates its CRC-8
    pub fn read<R: std::io::Read>(reader: R, streaminfo: &Streaminfo) -> Result<Self, Error> {
        use crate::crc::{Checksum, Crc8, CrcReader};
        use bitstream_io::{BigEndian, BitReader};

        let mut crc8: CrcReader<_, Crc8> = CrcReader::new(reader);
        BitReader::endian(crc8.by_ref(), BigEndian)
            .parse_with(streaminfo)
            .and_then(|header| {
                crc8.into_checksum()
                    .valid()
                    .then_some(header)
                    .ok_or(Error::Crc8Mismatch)
            })
    }

    /// Builds the header to the given writer, followed by its CRC-8
    pub fn write<W: std::io::Write>(
        &self,
        writer: &mut W,
        streaminfo: &Streaminfo,
    ) -> Result<(), Error> {
        use crate::crc::{Crc8, CrcWriter};
        use bitstream_io::{BigEndian, BitWriter};
        use std::io::Write;

        let mut crc8: CrcWriter<_, Crc8> = CrcWriter::new(writer.by_ref());
        BitWriter::endian(crc8.by_ref(), BigEndian).build_with(self, streaminfo)?;
        let crc8 = crc8.into_checksum().into();
        writer.write_all(std::slice::from_ref(&crc8))?;
        Ok(())
    }

    fn parse<R: BitRead + ?Sized>(
        r: &mut R,
        non_subset_rate: impl FnOnce() -> Result<u32, Error>,
        non_subset_bps: impl FnOnce() -> Result<u32, Error>,
    ) -> Result<Self, Error> {
        r.read_const::<15, { Self::SYNC_CODE }, _>(Error::InvalidSyncCode)?;
        let blocking_strategy = r.read_bit()?;
        let encoded_block_size = r.read::<4, u8>()?;
        let encoded_sample_rate = r.read::<4, u8>()?;
        let encoded_channels = r.read::<4, u8>()?;
        let encoded_bps = r.read::<3, u8>()?;
        r.skip(1)?;
        let frame_number: FrameNumber = r.parse()?;

        // fixed blocking carries a frame index, a 31-bit value
        if !blocking_strategy && (frame_number.0 >> 31) != 0 {
            return Err(Error::InvalidFrameNumber);
        }

        let frame_header = Self {
            blocking_strategy,
            frame_number,
            block_size: match encoded_block_size {
                0b0000 => return Err(Error::InvalidBlockSize),
                0b0001 => 192,
                v @ 0b0010..=0b0101 => 576 << (v - 2),
                0b0110 => r.read::<8, u32>()? + 1,
                0b0111 => r.read::<16, u32>()? + 1,
                v @ 0b1000..=0b1111 => 256 << (v - 8),
                _ => unreachable!(), // 4-bit field
            },
            sample_rate: match encoded_sample_rate {
                0b0000 => non_subset_rate()?,
                0b0001 => 88200,
                0b0010 => 176400,
                0b0011 => 192000,
                0b0100 => 8000,
                0b0101 => 16000,
                0b0110 => 22050,
                0b0111 => 24000,
                0b1000 => 32000,
                0b1001 => 44100,
                0b1010 => 48000,
                0b1011 => 96000,
                0b1100 => r.read::<8, u32>()? * 1000,
                0b1101 => r.read::<16, _>()?,
                0b1110 => r.read::<16, u32>()? * 10,
                0b1111 => return Err(Error::InvalidSampleRate),
                _ => unreachable!(), // 4-bit field
            },
            channel_assignment: match encoded_channels {
                c @ 0b0000..=0b0111 => ChannelAssignment::Independent(c + 1),
                0b1000 => ChannelAssignment::LeftSide,
                0b1001 => ChannelAssignment::SideRight,
                0b1010 => ChannelAssignment::MidSide,
                0b1011..=0b1111 => return Err(Error::InvalidChannels),
                _ => unreachable!(), // 4-bit field
            },
            bits_per_sample: match encoded_bps {
                0b000 => non_subset_bps()?,
                0b001 => 8,
                0b010 => 12,
                0b100 => 16,
                0b101 => 20,
                0b110 => 24,
                // 0b011 and 0b111 are reserved
                _ => return Err(Error::InvalidBitsPerSample),
            },
        };

        r.skip(8)?; // CRC-8

        Ok(frame_header)
    }

    fn build<W: BitWrite + ?Sized>(
        &self,
        w: &mut W,
        non_subset_rate: impl FnOnce() -> Result<u32, Error>,
        non_subset_bps: impl FnOnce() -> Result<u32, Error>,
    ) -> Result<(), Error> {
        w.write_const::<15, { Self::SYNC_CODE }>()?;

        w.write_bit(self.blocking_strategy)?;

        w.write::<4, u8>(match self.block_size {
            0 => return Err(Error::InvalidBlockSize),
            192 => 0b0001,
            576 => 0b0010,
            1152 => 0b0011,
            2304 => 0b0100,
            4608 => 0b0101,
            256 => 0b1000,
            512 => 0b1001,
            1024 => 0b1010,
            2048 => 0b1011,
            4096 => 0b1100,
            8192 => 0b1101,
            16384 => 0b1110,
            32768 => 0b1111,
            size if size <= 256 => 0b0110,
            size if size <= 65536 => 0b0111,
            _ => return Err(Error::InvalidBlockSize),
        })?;

        w.write::<4, u8>(match self.sample_rate {
            88200 => 0b0001,
            176400 => 0b0010,
            192000 => 0b0011,
            8000 => 0b0100,
            16000 => 0b0101,
            22050 => 0b0110,
            24000 => 0b0111,
            32000 => 0b1000,
            44100 => 0b1001,
            48000 => 0b1010,
            96000 => 0b1011,
            rate if (rate % 1000) == 0 && (rate / 1000) < 256 => 0b1100,
            rate if (rate % 10) == 0 && (rate / 10) < 65536 => 0b1110,
            rate if rate < 65536 => 0b1101,
            rate if rate == non_subset_rate()? => 0b0000,
            _ => return Err(Error::InvalidSampleRate),
        })?;

        w.write::<4, u8>(match self.channel_assignment {
            ChannelAssignment::Independent(c) => c - 1,
            ChannelAssignment::LeftSide => 0b1000,
            ChannelAssignment::SideRight => 0b1001,
            ChannelAssignment::MidSide => 0b1010,
        })?;

        w.write::<3, u8>(match self.bits_per_sample {
            8 => 0b001,
            12 => 0b010,
            16 => 0b100,
            20 => 0b101,
            24 => 0b110,
            bps if bps == non_subset_bps()? => 0b000,
            _ => return Err(Error::InvalidBitsPerSample),
        })?;

        w.pad(1)?;

        w.build(&self.frame_number)?;

        // uncommon block size
        match self.block_size {
            192 | 576 | 1152 | 2304 | 4608 | 256 | 512 | 1024 | 2048 | 4096 | 8192 | 16384
            | 32768 => { /* already coded directly */ }
            size if size <= 256 => w.write::<8, u32>(size - 1)?,
            size => w.write::<16, u32>(size - 1)?,
        }

        // uncommon sample rate
        match self.sample_rate {
            88200 | 176400 | 192000 | 8000 | 16000 | 22050 | 24000 | 32000 | 44100 | 48000
            | 96000 => { /* already coded directly */ }
            rate if (rate % 1000) == 0 && (rate / 1000) < 256 => {
                w.write::<8, u32>(rate / 1000)?;
            }
            rate if (rate % 10) == 0 && (rate / 10) < 65536 => {
                w.write::<16, u32>(rate / 10)?;
            }
            rate if rate < 65536 => {
                w.write::<16, u32>(rate)?;
            }
            _ => { /* inherited from STREAMINFO */ }
        }

        Ok(())
    }
}

impl FromBitStreamWith<'_> for FrameHeader {
    type Error = Error;
    type Context = Streaminfo;

    fn from_reader<R: BitRead + ?Sized>(
        r: &mut R,
        streaminfo: &Streaminfo,
    ) -> Result<Self, Self::Error> {
        FrameHeader::parse(
            r,
            || Ok(streaminfo.sample_rate),
            || Ok(streaminfo.bits_per_sample()),
        )
        .and_then(|h| {
            (h.block_size <= u32::from(streaminfo.maximum_block_size))
                .then_some(h)
                .ok_or(Error::BlockSizeMismatch)
        })
        .and_then(|h| {
            (h.sample_rate == streaminfo.sample_rate)
                .then_some(h)
                .ok_or(Error::SampleRateMismatch)
        })
        .and_then(|h| {
            (h.channel_assignment.count() == streaminfo.channels.get())
                .then_some(h)
                .ok_or(Error::ChannelsMismatch)
        })
        .and_then(|h| {
            (h.bits_per_sample == streaminfo.bits_per_sample())
                .then_some(h)
                .ok_or(Error::BitsPerSampleMismatch)
        })
    }
}

impl ToBitStreamWith<'_> for FrameHeader {
    type Error = Error;
    type Context = Streaminfo;

    #[inline]
    fn to_writer<W: BitWrite + ?Sized>(
        &self,
        w: &mut W,
        streaminfo: &Streaminfo,
    ) -> Result<(), Self::Error> {
        self.build(
            w,
            || Ok(streaminfo.sample_rate),
            || Ok(streaminfo.bits_per_sample()),
        )
    }
}

/// How the channels are assigned in a FLAC frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelAssignment {
    /// Channels are stored independently
    Independent(u8),
    /// Channel 0 is stored verbatim, channel 1 derived from both
    LeftSide,
    /// Channel 0 is derived from both, channel 1 is stored verbatim
    SideRight,
    /// Channel 0 is averaged from both, channel 1 is derived from both
    MidSide,
}

impl ChannelAssignment {
    /// Returns total number of channels defined by assignment
    pub fn count(&self) -> u8 {
        match self {
            Self::Independent(c) => *c,
            _ => 2,
        }
    }
}

/// A frame's position in the stream
///
/// This is the frame's index when the blocking strategy is fixed,
/// or the offset of its first sample when variable, stored
/// as a UTF-8-style variable-length integer of 1 to 7 bytes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    /// The largest encodable value (2³⁶ - 1)
    pub const MAX: u64 = (1 << 36) - 1;
}

impl FromBitStream for FrameNumber {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Error> {
        match r.read_unary::<0>()? {
            0 => Ok(Self(r.read::<7, _>()?)),
            1 => Err(Error::InvalidFrameNumber),
            bytes @ 2..=7 => {
                let mut frame = r.read_var(7 - bytes)?;
                for _ in 1..bytes {
                    r.read_const::<2, 0b10, _>(Error::InvalidFrameNumber)?;
                    frame = (frame << 6) | r.read::<6, u64>()?;
                }
                Ok(Self(frame))
            }
            _ => Err(Error::InvalidFrameNumber),
        }
    }
}

impl ToBitStream for FrameNumber {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Error> {
        #[inline]
        fn byte(num: u64, byte: u32) -> u8 {
            0b10_000000 | ((num >> (6 * byte)) & 0b111111) as u8
        }

        match self.0 {
            v @ 0..=0x7F => {
                w.write_unary::<0>(0)?;
                w.write::<7, _>(v)?;
                Ok(())
            }
            v @ 0x80..=0x7FF => {
                w.write_unary::<0>(2)?;
                w.write::<5, _>(v >> 6)?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            v @ 0x800..=0xFFFF => {
                w.write_unary::<0>(3)?;
                w.write::<4, _>(v >> (6 * 2))?;
                w.write::<8, _>(byte(v, 1))?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            v @ 0x1_0000..=0x1F_FFFF => {
                w.write_unary::<0>(4)?;
                w.write::<3, _>(v >> (6 * 3))?;
                w.write::<8, _>(byte(v, 2))?;
                w.write::<8, _>(byte(v, 1))?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            v @ 0x20_0000..=0x3FF_FFFF => {
                w.write_unary::<0>(5)?;
                w.write::<2, _>(v >> (6 * 4))?;
                w.write::<8, _>(byte(v, 3))?;
                w.write::<8, _>(byte(v, 2))?;
                w.write::<8, _>(byte(v, 1))?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            v @ 0x400_0000..=0x7FFF_FFFF => {
                w.write_unary::<0>(6)?;
                w.write::<1, _>(v >> (6 * 5))?;
                w.write::<8, _>(byte(v, 4))?;
                w.write::<8, _>(byte(v, 3))?;
                w.write::<8, _>(byte(v, 2))?;
                w.write::<8, _>(byte(v, 1))?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            v @ 0x8000_0000..=0xF_FFFF_FFFF => {
                w.write_unary::<0>(7)?;
                w.write::<8, _>(byte(v, 5))?;
                w.write::<8, _>(byte(v, 4))?;
                w.write::<8, _>(byte(v, 3))?;
                w.write::<8, _>(byte(v, 2))?;
                w.write::<8, _>(byte(v, 1))?;
                w.write::<8, _>(byte(v, 0))?;
                Ok(())
            }
            _ => Err(Error::InvalidFrameNumber),
        }
    }
}

/// A subframe header
#[derive(Debug)]
pub struct SubframeHeader {
    /// The subframe's type
    pub type_: SubframeHeaderType,
    /// The number of wasted bits-per-sample
    pub wasted_bps: u32,
}

impl FromBitStream for SubframeHeader {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Error> {
        r.read_const::<1, 0, _>(Error::InvalidSubframeHeader)?;
        Ok(Self {
            type_: r.parse()?,
            wasted_bps: match r.read_bit()? {
                false => 0,
                true => r.read_unary::<1>()? + 1,
            },
        })
    }
}

impl ToBitStream for SubframeHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Error> {
        w.write_const::<1, 0>()?;
        w.build(&self.type_)?;
        match self.wasted_bps.checked_sub(1) {
            None => w.write_bit(false)?,
            Some(wasted) => {
                w.write_bit(true)?;
                w.write_unary::<1>(wasted)?;
            }
        }

        Ok(())
    }
}

/// A subframe header's type
#[derive(Debug)]
pub enum SubframeHeaderType {
    /// All samples are the same
    Constant,
    /// All samples are stored verbatim, without compression
    Verbatim,
    /// Samples are predicted with one of a set of fixed coefficients
    Fixed(&'static [i64]),
    /// Samples are predicted with dynamic LPC parameters
    Lpc(NonZero<u8>),
}

impl FromBitStream for SubframeHeaderType {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Error> {
        match r.read::<6, u8>()? {
            0b000000 => Ok(Self::Constant),
            0b000001 => Ok(Self::Verbatim),
            v @ 0b001000..=0b001100 => Ok(Self::Fixed(FIXED_COEFFICIENTS[usize::from(v - 8)])),
            v @ 0b100000..=0b111111 => Ok(Self::Lpc(NonZero::new(v - 31).unwrap())),
            _ => Err(Error::ReservedSubframeType),
        }
    }
}

impl ToBitStream for SubframeHeaderType {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Error> {
        w.write::<6, u8>(match self {
            Self::Constant => 0b000000,
            Self::Verbatim => 0b000001,
            Self::Fixed(coefficients) => 0b001000 + coefficients.len() as u8,
            Self::Lpc(order) => order.get() + 31,
        })?;
        Ok(())
    }
}

/// A residual coding method
///
/// Method 0 uses 4-bit Rice parameters with escape code 15,
/// method 1 uses 5-bit Rice parameters with escape code 31.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResidualMethod {
    /// 4-bit Rice parameters
    FourBit,
    /// 5-bit Rice parameters
    FiveBit,
}

impl ResidualMethod {
    pub(crate) fn param_bits(self) -> u32 {
        match self {
            Self::FourBit => 4,
            Self::FiveBit => 5,
        }
    }

    pub(crate) fn escape_code(self) -> u32 {
        match self {
            Self::FourBit => 0xF,
            Self::FiveBit => 0x1F,
        }
    }
}

impl FromBitStream for ResidualMethod {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Error> {
        match r.read::<2, u8>()? {
            0 => Ok(Self::FourBit),
            1 => Ok(Self::FiveBit),
            _ => Err(Error::ReservedResidualMethod),
        }
    }
}

impl ToBitStream for ResidualMethod {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
        w.write::<2, u8>(match self {
            Self::FourBit => 0,
            Self::FiveBit => 1,
        })
    }
}

/// A single residual partition's header
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResidualPartitionHeader {
    /// Rice-coded residuals with the given parameter
    Standard {
        /// The partition's Rice parameter
        rice: u32,
    },
    /// Residuals stored as fixed-width two's complement integers
    Escaped {
        /// The residuals' width in bits, up to 31
        width: u32,
    },
}

impl FromBitStreamUsing for ResidualPartitionHeader {
    type Context = ResidualMethod;
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R, method: ResidualMethod) -> Result<Self, Error> {
        match r.read_var::<u32>(method.param_bits())? {
            param if param == method.escape_code() => Ok(Self::Escaped {
                width: r.read::<5, _>()?,
            }),
            rice => Ok(Self::Standard { rice }),
        }
    }
}

impl ToBitStreamUsing for ResidualPartitionHeader {
    type Context = ResidualMethod;
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(
        &self,
        w: &mut W,
        method: ResidualMethod,
    ) -> Result<(), std::io::Error> {
        match self {
            Self::Standard { rice } => w.write_var(method.param_bits(), *rice),
            Self::Escaped { width } => {
                w.write_var(method.param_bits(), method.escape_code())?;
                w.write::<5, _>(*width)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstream_io::{BigEndian, BitReader, BitWriter};

    #[test]
    fn test_frame_number_roundtrip() {
        let mut buf: [u8; 7] = [0; 7];

        for i in (0..=0xFFFF)
            .chain((0x1_0000..=0x1F_FFFF).step_by(257))
            .chain((0x20_0000..=0x3FF_FFFF).step_by(65539))
            .chain((0x400_0000..=0x7FFF_FFFF).step_by(16777259))
            .chain((0x8000_0000..=0xF_FFFF_FFFF).step_by(268435459))
            .chain(std::iter::once(FrameNumber::MAX))
        {
            let num = FrameNumber(i);

            assert!(
                BitWriter::endian(buf.as_mut_slice(), BigEndian)
                    .build(&num)
                    .is_ok()
            );

            let num2 = BitReader::endian(buf.as_slice(), BigEndian)
                .parse::<FrameNumber>()
                .unwrap();

            assert_eq!(num.0, num2.0);

            buf.fill(0);
        }
    }

    #[test]
    fn test_frame_number_too_large() {
        let mut buf: [u8; 8] = [0; 8];
        assert!(
            BitWriter::endian(buf.as_mut_slice(), BigEndian)
                .build(&FrameNumber(FrameNumber::MAX + 1))
                .is_err()
        );
    }

    #[test]
    fn test_subframe_header_roundtrip() {
        for wasted_bps in [0, 1, 2, 7, 31] {
            let mut buf = Vec::new();
            let mut w = BitWriter::endian(&mut buf, BigEndian);
            w.build(&SubframeHeader {
                type_: SubframeHeaderType::Constant,
                wasted_bps,
            })
            .unwrap();
            w.byte_align().unwrap();

            let header = BitReader::endian(buf.as_slice(), BigEndian)
                .parse::<SubframeHeader>()
                .unwrap();
            assert_eq!(header.wasted_bps, wasted_bps);
            assert!(matches!(header.type_, SubframeHeaderType::Constant));
        }
    }

    fn test_streaminfo() -> Streaminfo {
        use std::num::NonZero;

        Streaminfo {
            minimum_block_size: 4096,
            maximum_block_size: 65535,
            minimum_frame_size: None,
            maximum_frame_size: None,
            sample_rate: 44100,
            channels: NonZero::new(2).unwrap(),
            bits_per_sample: 16u32.try_into().unwrap(),
            total_samples: None,
            md5: None,
        }
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let streaminfo = test_streaminfo();

        for block_size in [1, 2, 192, 193, 255, 256, 257, 4096, 4608, 65535] {
            let header = FrameHeader {
                blocking_strategy: false,
                block_size,
                sample_rate: 44100,
                channel_assignment: ChannelAssignment::MidSide,
                bits_per_sample: 16,
                frame_number: FrameNumber(17),
            };

            let mut buf = Vec::new();
            header.write(&mut buf, &streaminfo).unwrap();

            let parsed = FrameHeader::read(buf.as_slice(), &streaminfo).unwrap();
            assert_eq!(parsed.block_size, block_size);
            assert_eq!(parsed.sample_rate, 44100);
            assert_eq!(parsed.bits_per_sample, 16);
            assert_eq!(parsed.channel_assignment, ChannelAssignment::MidSide);
            assert_eq!(parsed.frame_number, FrameNumber(17));
        }
    }

    #[test]
    fn test_largest_block_size() {
        // 65536 samples only fits the 16-bit size-minus-one encoding
        let streaminfo = Streaminfo {
            maximum_block_size: 65535,
            ..test_streaminfo()
        };

        let header = FrameHeader {
            blocking_strategy: true,
            block_size: 65536,
            sample_rate: 44100,
            channel_assignment: ChannelAssignment::Independent(2),
            bits_per_sample: 16,
            frame_number: FrameNumber(0),
        };

        let mut buf = Vec::new();
        header.write(&mut buf, &streaminfo).unwrap();

        // the size survives its 16-bit size-minus-one coding
        let parsed = FrameHeader::parse(
            &mut BitReader::endian(buf.as_slice(), BigEndian),
            || Ok(44100),
            || Ok(16),
        )
        .unwrap();
        assert_eq!(parsed.block_size, 65536);

        // but the STREAMINFO maximum is a 16-bit field, so such a
        // frame always exceeds the declared maximum
        assert!(matches!(
            FrameHeader::read(buf.as_slice(), &streaminfo),
            Err(Error::BlockSizeMismatch),
        ));
    }

    #[test]
    fn test_corrupt_header_crc() {
        let streaminfo = test_streaminfo();

        let header = FrameHeader {
            blocking_strategy: false,
            block_size: 4096,
            sample_rate: 44100,
            channel_assignment: ChannelAssignment::Independent(2),
            bits_per_sample: 16,
            frame_number: FrameNumber(0),
        };

        let mut buf = Vec::new();
        header.write(&mut buf, &streaminfo).unwrap();

        // flipping the frame number keeps the header parseable
        // but must break its CRC-8
        let position = buf.len() - 2;
        buf[position] ^= 0x01;
        assert!(matches!(
            FrameHeader::read(buf.as_slice(), &streaminfo),
            Err(Error::Crc8Mismatch),
        ));
    }

    #[test]
    fn test_residual_partition_header_roundtrip() {
        for method in [ResidualMethod::FourBit, ResidualMethod::FiveBit] {
            for header in [
                ResidualPartitionHeader::Standard { rice: 0 },
                ResidualPartitionHeader::Standard { rice: 14 },
                ResidualPartitionHeader::Escaped { width: 17 },
            ] {
                let mut buf = Vec::new();
                let mut w = BitWriter::endian(&mut buf, BigEndian);
                w.build_using(&header, method).unwrap();
                w.byte_align().unwrap();

                assert_eq!(
                    BitReader::endian(buf.as_slice(), BigEndian)
                        .parse_using::<ResidualPartitionHeader>(method)
                        .unwrap(),
                    header,
                );
            }
        }
    }
}
