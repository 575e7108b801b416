// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling a FLAC file's metadata blocks
//!
//! Every FLAC file starts with the `fLaC` tag followed by one or
//! more metadata blocks, the first of which must be
//! [STREAMINFO](`Streaminfo`).  The codec understands STREAMINFO and
//! [SEEKTABLE](`SeekTable`); any other block type is carried through
//! verbatim as an [`UnknownBlock`].

use crate::Error;
use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, BitWriter, FromBitStream, FromBitStreamUsing,
    SignedBitCount, ToBitStream,
};
use std::num::NonZero;

const FLAC_TAG: &[u8; 4] = b"fLaC";

/// A FLAC metadata block header
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 1    | `last` | final metadata block in file |
/// | 7    | `block_type` | type of block |
/// | 24   | `size` | block size, in bytes |
#[derive(Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Whether we are the final block
    pub last: bool,
    /// Our block type
    pub block_type: BlockType,
    /// Our block size in bytes, a 24-bit value
    pub size: u32,
}

impl BlockHeader {
    const MAX_SIZE: u32 = (1 << 24) - 1;
}

impl FromBitStream for BlockHeader {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            last: r.read_bit()?,
            block_type: r.parse()?,
            size: r.read::<24, _>()?,
        })
    }
}

impl ToBitStream for BlockHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_bit(self.last)?;
        w.build(&self.block_type)?;
        if self.size > Self::MAX_SIZE {
            return Err(Error::ExcessiveBlockSize);
        }
        w.write::<24, _>(self.size)?;
        Ok(())
    }
}

/// A FLAC metadata block type
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockType {
    /// The STREAMINFO block
    Streaminfo,
    /// The SEEKTABLE block
    SeekTable,
    /// Any other defined or reserved block type
    Other(u8),
}

impl FromBitStream for BlockType {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        match r.read::<7, u8>()? {
            0 => Ok(Self::Streaminfo),
            3 => Ok(Self::SeekTable),
            // the all-ones type is forbidden to avoid
            // colliding with the frame sync code
            127 => Err(Error::InvalidMetadataBlock),
            t => Ok(Self::Other(t)),
        }
    }
}

impl ToBitStream for BlockType {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<7, u8>(match self {
            Self::Streaminfo => 0,
            Self::SeekTable => 3,
            Self::Other(t @ 1..=126) => *t,
            Self::Other(_) => return Err(Error::InvalidMetadataBlock),
        })?;
        Ok(())
    }
}

/// The STREAMINFO metadata block
///
/// A 34-byte record describing the entire stream, always the
/// first block in the file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Streaminfo {
    /// The minimum block size (in samples) used in the stream,
    /// excluding the last block.
    pub minimum_block_size: u16,
    /// The maximum block size (in samples) used in the stream,
    /// excluding the last block.
    pub maximum_block_size: u16,
    /// The minimum frame size (in bytes) used in the stream.
    ///
    /// `None` indicates the value is unknown.
    pub minimum_frame_size: Option<NonZero<u32>>,
    /// The maximum frame size (in bytes) used in the stream.
    ///
    /// `None` indicates the value is unknown.
    pub maximum_frame_size: Option<NonZero<u32>>,
    /// Sample rate in Hz, from 1 to 655350
    pub sample_rate: u32,
    /// Number of channels, from 1 to 8
    pub channels: NonZero<u8>,
    /// Number of bits-per-sample, from 4 to 32
    pub bits_per_sample: SignedBitCount<32>,
    /// Total number of interchannel samples in stream.
    ///
    /// `None` indicates the value is unknown.
    pub total_samples: Option<NonZero<u64>>,
    /// MD5 hash of the unencoded audio data.
    ///
    /// `None` indicates the hash was not computed.
    pub md5: Option<[u8; 16]>,
}

impl Streaminfo {
    /// The maximum size of a frame, in bytes (2²⁴ - 1)
    pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

    /// The maximum sample rate, in Hz
    pub const MAX_SAMPLE_RATE: u32 = 655350;

    /// The maximum number of channels (8)
    pub const MAX_CHANNELS: NonZero<u8> = NonZero::new(8).unwrap();

    /// The maximum number of total samples (2³⁶ - 1)
    pub const MAX_TOTAL_SAMPLES: u64 = (1 << 36) - 1;

    /// Defined size of the STREAMINFO block, in bytes
    pub const SIZE: u32 = 34;

    /// Returns bits-per-sample as a plain bit count
    #[inline]
    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample.into()
    }
}

impl FromBitStream for Streaminfo {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        let minimum_block_size = r.read::<16, u16>()?;
        let maximum_block_size = r.read::<16, u16>()?;
        if minimum_block_size == 0 || maximum_block_size < minimum_block_size {
            return Err(Error::InvalidBlockSize);
        }

        let minimum_frame_size = r.read::<24, Option<NonZero<u32>>>()?;
        let maximum_frame_size = r.read::<24, Option<NonZero<u32>>>()?;
        if let (Some(min), Some(max)) = (minimum_frame_size, maximum_frame_size) {
            if max < min {
                return Err(Error::InvalidMetadataBlock);
            }
        }

        Ok(Self {
            minimum_block_size,
            maximum_block_size,
            minimum_frame_size,
            maximum_frame_size,
            sample_rate: match r.read::<20, u32>()? {
                0 => return Err(Error::InvalidSampleRate),
                rate @ 1..=Self::MAX_SAMPLE_RATE => rate,
                _ => return Err(Error::InvalidSampleRate),
            },
            channels: r.read::<3, _>()?,
            bits_per_sample: match r.read::<5, u32>()? + 1 {
                bps @ 4..=32 => bps.try_into().map_err(|_| Error::InvalidBitsPerSample)?,
                _ => return Err(Error::InvalidBitsPerSample),
            },
            total_samples: r.read::<36, _>()?,
            md5: r
                .read_to()
                .map(|md5: [u8; 16]| md5.iter().any(|b| *b != 0).then_some(md5))?,
        })
    }
}

impl ToBitStream for Streaminfo {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<16, _>(self.minimum_block_size)?;
        w.write::<16, _>(self.maximum_block_size)?;
        w.write::<24, _>(self.minimum_frame_size)?;
        w.write::<24, _>(self.maximum_frame_size)?;
        w.write::<20, _>(self.sample_rate)?;
        w.write::<3, _>(self.channels)?;
        w.write::<5, _>(u32::from(self.bits_per_sample) - 1)?;
        w.write::<36, _>(self.total_samples)?;
        w.write_from(self.md5.unwrap_or([0; 16]))?;
        Ok(())
    }
}

/// The SEEKTABLE metadata block
///
/// Because FLAC frames do not store their compressed length,
/// a seek table is used for random access within a FLAC file.
/// Seek point byte offsets are relative to the start of the
/// first FLAC frame, *not* to the start of the file, so metadata
/// blocks may be resized without invalidating the table.
///
/// This block may occur only once in a FLAC file.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SeekTable {
    /// All seek points, in ascending sample order
    pub points: Vec<SeekPoint>,
}

/// A single 18-byte seek point
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SeekPoint {
    /// Sample number of the first sample in the target frame,
    /// or `None` for a placeholder point
    pub sample_offset: Option<u64>,
    /// Offset in bytes from the first frame to the target frame
    pub byte_offset: u64,
    /// Number of samples in the target frame
    pub frame_samples: u16,
}

impl SeekPoint {
    const PLACEHOLDER_OFFSET: u64 = u64::MAX;

    /// A placeholder point, ignored when seeking
    pub const PLACEHOLDER: Self = Self {
        sample_offset: None,
        byte_offset: 0,
        frame_samples: 0,
    };
}

impl SeekTable {
    const POINT_SIZE: u32 = 18;

    // Real points must increment in both offsets; placeholders may
    // appear anywhere.
    fn check_points(&self) -> Result<(), Error> {
        self.points
            .iter()
            .filter(|p| p.sample_offset.is_some())
            .try_fold(None, |previous: Option<&SeekPoint>, point| {
                if let Some(previous) = previous {
                    if point.sample_offset <= previous.sample_offset
                        || point.byte_offset < previous.byte_offset
                    {
                        return Err(Error::InvalidSeekTablePoint);
                    }
                }
                Ok(Some(point))
            })
            .map(|_| ())
    }

    /// Returns the last real seek point at or before the given sample
    pub fn best_point_for(&self, sample: u64) -> Option<&SeekPoint> {
        self.points
            .iter()
            .filter(|p| p.sample_offset.is_some_and(|offset| offset <= sample))
            .next_back()
    }
}

impl FromBitStreamUsing for SeekTable {
    type Context = u32;
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R, size: u32) -> Result<Self, Self::Error> {
        if size % Self::POINT_SIZE != 0 {
            return Err(Error::InvalidSeekTableSize);
        }

        let table = Self {
            points: (0..size / Self::POINT_SIZE)
                .map(|_| {
                    Ok(SeekPoint {
                        sample_offset: match r.read::<64, u64>()? {
                            SeekPoint::PLACEHOLDER_OFFSET => None,
                            offset => Some(offset),
                        },
                        byte_offset: r.read::<64, _>()?,
                        frame_samples: r.read::<16, _>()?,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?,
        };

        table.check_points()?;
        Ok(table)
    }
}

impl ToBitStream for SeekTable {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        self.check_points()?;
        for point in &self.points {
            w.write::<64, _>(
                point
                    .sample_offset
                    .unwrap_or(SeekPoint::PLACEHOLDER_OFFSET),
            )?;
            w.write::<64, _>(point.byte_offset)?;
            w.write::<16, _>(point.frame_samples)?;
        }
        Ok(())
    }
}

/// A metadata block of a type this codec treats as opaque
///
/// Its contents are retained byte-for-byte so that rewriting a
/// file's metadata preserves blocks we don't interpret.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnknownBlock {
    /// The block's 7-bit type, from 1 to 126
    pub block_type: u8,
    /// The block's contents, verbatim
    pub data: Vec<u8>,
}

/// A complete FLAC metadata block
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Block {
    /// The STREAMINFO block
    Streaminfo(Streaminfo),
    /// The SEEKTABLE block
    SeekTable(SeekTable),
    /// Any other block, carried verbatim
    Unknown(UnknownBlock),
}

impl Block {
    fn header(&self, last: bool) -> Result<BlockHeader, Error> {
        Ok(BlockHeader {
            last,
            block_type: match self {
                Self::Streaminfo(_) => BlockType::Streaminfo,
                Self::SeekTable(_) => BlockType::SeekTable,
                Self::Unknown(u) => BlockType::Other(u.block_type),
            },
            size: match self {
                Self::Streaminfo(_) => Streaminfo::SIZE,
                Self::SeekTable(s) => u32::try_from(s.points.len())
                    .ok()
                    .and_then(|points| points.checked_mul(SeekTable::POINT_SIZE))
                    .filter(|size| *size <= BlockHeader::MAX_SIZE)
                    .ok_or(Error::ExcessiveBlockSize)?,
                Self::Unknown(u) => u32::try_from(u.data.len())
                    .ok()
                    .filter(|size| *size <= BlockHeader::MAX_SIZE)
                    .ok_or(Error::ExcessiveBlockSize)?,
            },
        })
    }
}

impl From<Streaminfo> for Block {
    fn from(streaminfo: Streaminfo) -> Self {
        Self::Streaminfo(streaminfo)
    }
}

impl From<SeekTable> for Block {
    fn from(seektable: SeekTable) -> Self {
        Self::SeekTable(seektable)
    }
}

/// An iterator over FLAC metadata blocks
pub struct BlockIterator<R: std::io::Read> {
    reader: R,
    failed: bool,
    tag_read: bool,
    streaminfo_read: bool,
    seektable_read: bool,
    finished: bool,
}

impl<R: std::io::Read> BlockIterator<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
            tag_read: false,
            streaminfo_read: false,
            seektable_read: false,
            finished: false,
        }
    }

    fn read_block(&mut self) -> Option<Result<Block, Error>> {
        // like a slightly easier variant of "Take"
        struct LimitedReader<R> {
            reader: R,
            size: usize,
        }

        impl<R: std::io::Read> std::io::Read for LimitedReader<R> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let size = self.size.min(buf.len());
                self.reader.read(&mut buf[0..size]).inspect(|amt_read| {
                    self.size -= amt_read;
                })
            }
        }

        (!self.finished).then(|| {
            BitReader::endian(&mut self.reader, BigEndian)
                .parse()
                .and_then(|header: BlockHeader| {
                    let mut reader = BitReader::endian(
                        LimitedReader {
                            reader: self.reader.by_ref(),
                            size: header.size as usize,
                        },
                        BigEndian,
                    );

                    let block = match header.block_type {
                        BlockType::Streaminfo => {
                            if header.size != Streaminfo::SIZE {
                                return Err(Error::InvalidMetadataBlockSize);
                            }
                            Block::Streaminfo(reader.parse()?)
                        }
                        BlockType::SeekTable => {
                            Block::SeekTable(reader.parse_using(header.size)?)
                        }
                        BlockType::Other(block_type) => Block::Unknown(UnknownBlock {
                            block_type,
                            data: reader.read_to_vec(header.size as usize)?,
                        }),
                    };

                    match reader.into_reader().size {
                        0 => {
                            self.finished = header.last;
                            Ok(block)
                        }
                        _ => Err(Error::InvalidMetadataBlockSize),
                    }
                })
        })
    }
}

impl<R: std::io::Read> Iterator for BlockIterator<R> {
    type Item = Result<Block, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            // once we hit an error, stop any further reads
            None
        } else if !self.tag_read {
            // "fLaC" tag must come before anything else
            let mut tag = [0; 4];
            match self.reader.read_exact(&mut tag) {
                Ok(()) => match &tag {
                    FLAC_TAG => {
                        self.tag_read = true;
                        self.next()
                    }
                    _ => {
                        self.failed = true;
                        Some(Err(Error::MissingFlacTag))
                    }
                },
                Err(err) => {
                    self.failed = true;
                    Some(Err(Error::Io(err)))
                }
            }
        } else if !self.streaminfo_read {
            // STREAMINFO block must be first in file
            match self.read_block() {
                block @ Some(Ok(Block::Streaminfo(_))) => {
                    self.streaminfo_read = true;
                    block
                }
                Some(Err(err)) => {
                    self.failed = true;
                    Some(Err(err))
                }
                _ => {
                    self.failed = true;
                    Some(Err(Error::MissingStreaminfo))
                }
            }
        } else {
            match self.read_block() {
                Some(Ok(Block::Streaminfo(_))) => {
                    self.failed = true;
                    Some(Err(Error::MultipleStreaminfo))
                }
                seektable @ Some(Ok(Block::SeekTable(_))) => {
                    if !self.seektable_read {
                        self.seektable_read = true;
                        seektable
                    } else {
                        self.failed = true;
                        Some(Err(Error::MultipleSeekTable))
                    }
                }
                block @ Some(Err(_)) => {
                    self.failed = true;
                    block
                }
                block => block,
            }
        }
    }
}

/// Returns iterator of blocks from the given reader
///
/// The reader should be positioned at the start of the FLAC file.
///
/// Because this may perform many small reads,
/// using a buffered reader may greatly improve performance
/// when reading from a raw `File`.
pub fn read_blocks<R: std::io::Read>(r: R) -> BlockIterator<R> {
    BlockIterator::new(r)
}

/// Returns FLAC's STREAMINFO metadata block from the given reader
///
/// The reader is assumed to be positioned at the start of the
/// FLAC file data.
///
/// # Errors
///
/// Returns an error if the STREAMINFO block is not first
/// or if any I/O error occurs when reading the stream.
pub fn read_info<R: std::io::Read>(r: R) -> Result<Streaminfo, Error> {
    let mut r = BitReader::endian(r, BigEndian);

    // FLAC tag must be first thing in stream
    if &r.read_to::<[u8; 4]>()? != FLAC_TAG {
        return Err(Error::MissingFlacTag);
    }

    // STREAMINFO block must be present, and must be first
    if !matches!(
        r.parse()?,
        BlockHeader {
            block_type: BlockType::Streaminfo,
            size: Streaminfo::SIZE,
            last: _,
        }
    ) {
        return Err(Error::MissingStreaminfo);
    }

    // finally, parse the STREAMINFO block itself
    r.parse()
}

/// Writes the FLAC tag and the given sequence of blocks
///
/// The first block must be [STREAMINFO](`Streaminfo`), no further
/// STREAMINFO may occur, and at most one [SEEKTABLE](`SeekTable`)
/// is permitted.
///
/// # Errors
///
/// Passes along any I/O errors from the underlying stream.
/// May also generate an error if any of the blocks are invalid.
pub fn write_blocks<W: std::io::Write>(mut w: W, blocks: &[Block]) -> Result<(), Error> {
    // "fLaC" tag must come before anything else
    w.write_all(FLAC_TAG).map_err(Error::Io)?;

    if !matches!(blocks.first(), Some(Block::Streaminfo(_))) {
        return Err(Error::MissingStreaminfo);
    }

    let mut w = BitWriter::endian(w, BigEndian);
    let mut seektable_written = false;

    for (i, block) in blocks.iter().enumerate() {
        match block {
            Block::Streaminfo(_) if i > 0 => return Err(Error::MultipleStreaminfo),
            Block::SeekTable(_) => {
                if seektable_written {
                    return Err(Error::MultipleSeekTable);
                }
                seektable_written = true;
            }
            _ => {}
        }

        w.build(&block.header(i == blocks.len() - 1)?)?;
        match block {
            Block::Streaminfo(streaminfo) => w.build(streaminfo)?,
            Block::SeekTable(seektable) => w.build(seektable)?,
            Block::Unknown(unknown) => w.write_bytes(&unknown.data)?,
        }
    }

    Ok(())
}
