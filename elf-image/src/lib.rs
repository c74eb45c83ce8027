//! Streaming loader for 64-bit little-endian ELF executables
//!
//! The image is read strictly front to back from any `std::io::Read` source.
//! Opening parses and validates the file header and the program header table;
//! loadable segments are then pulled one at a time, in program-header-table
//! order, with their payload read only when the segment is requested. Bytes no
//! remaining segment needs are released as loading goes on.

use log::{debug, info};
use std::io::Read;
use thiserror::Error;

mod stream;

use stream::StreamReader;

// Absolute offsets in the ELF file header
const EI_MAG: u64 = 0x0;
const EI_CLASS: u64 = 0x4;
const EI_DATA: u64 = 0x5;
const E_ENTRY: u64 = 0x18;
const E_PHOFF: u64 = 0x20;
const E_PHENTSIZE: u64 = 0x36;
const E_PHNUM: u64 = 0x38;

// Offsets relative to a program header entry
const P_TYPE: u64 = 0x0;
const P_OFFSET: u64 = 0x8;
const P_VADDR: u64 = 0x10;
const P_FILESZ: u64 = 0x20;
const P_MEMSZ: u64 = 0x28;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// Size of one 64-bit program header entry.
pub const PHDR64_SIZE: u16 = 0x38;

/// Program header type of a loadable segment.
pub const PT_LOAD: u32 = 1;

/// Largest segment the loader will materialise.
pub const MAX_SEGMENT_SIZE: usize = 256 << 20;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed image: {0}")]
    MalformedImage(String),

    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Program header {index}: {source}")]
    Segment {
        index: u16,
        #[source]
        source: Box<ImageError>,
    },
}

impl ImageError {
    /// Program header entry the error was raised for, if any.
    pub fn segment_index(&self) -> Option<u16> {
        match self {
            ImageError::Segment { index, .. } => Some(*index),
            _ => None,
        }
    }

    fn in_segment(index: u16) -> impl FnOnce(ImageError) -> ImageError {
        move |source| ImageError::Segment {
            index,
            source: Box::new(source),
        }
    }
}

/// Fields of the ELF file header the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry_address: u64,
    pub ph_offset: u64,
    pub ph_entry_size: u16,
    pub ph_count: u16,
}

/// A loadable segment together with its payload.
///
/// `data` is always `mem_size` long: the first `file_size` bytes come from
/// the image, the remainder is zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Index of the program header entry that described this segment.
    pub index: u16,
    pub is_loadable: bool,
    pub file_offset: u64,
    pub virtual_addr: u64,
    pub file_size: usize,
    pub mem_size: usize,
    pub data: Vec<u8>,
}

/// Raw program header fields, as read from the table.
#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl ProgramHeader {
    /// File bytes this entry still needs, if it is loadable.
    fn payload_start(&self) -> Option<u64> {
        (self.p_type == PT_LOAD && self.filesz > 0).then_some(self.offset)
    }
}

/// An opened ELF image.
pub struct ImageLoader<R> {
    reader: StreamReader<R>,
    header: ImageHeader,
    entries: Vec<ProgramHeader>,
    next_entry: usize,
    failed: bool,
}

impl<R: Read> ImageLoader<R> {
    /// Parse and validate the file header and read the program header table.
    ///
    /// Fails with `UnsupportedFormat` unless the image is a 64-bit
    /// little-endian ELF; no program header is touched in that case.
    /// Segment payloads are not read here.
    pub fn open(source: R) -> Result<Self, ImageError> {
        info!("Opening ELF image");
        let mut reader = StreamReader::new(source);

        let mut magic = [0u8; 4];
        reader.read_at(EI_MAG, &mut magic)?;
        if magic != ELF_MAGIC {
            return Err(ImageError::UnsupportedFormat(format!(
                "bad magic {:02x?}",
                magic
            )));
        }

        let class = reader.read_u8(EI_CLASS)?;
        if class != ELFCLASS64 {
            return Err(ImageError::UnsupportedFormat(format!(
                "ELF not for 64-bit architecture (class {})",
                class
            )));
        }

        let data = reader.read_u8(EI_DATA)?;
        if data != ELFDATA2LSB {
            return Err(ImageError::UnsupportedFormat(format!(
                "ELF not little endian (encoding {})",
                data
            )));
        }

        let header = ImageHeader {
            entry_address: reader.read_u64(E_ENTRY)?,
            ph_offset: reader.read_u64(E_PHOFF)?,
            ph_entry_size: reader.read_u16(E_PHENTSIZE)?,
            ph_count: reader.read_u16(E_PHNUM)?,
        };

        if header.ph_count > 0 && header.ph_entry_size < PHDR64_SIZE {
            return Err(ImageError::MalformedImage(format!(
                "program header entry size {} is smaller than {}",
                header.ph_entry_size, PHDR64_SIZE
            )));
        }

        info!(
            "ELF entry 0x{:x}, {} program headers at 0x{:x}",
            header.entry_address, header.ph_count, header.ph_offset
        );

        let entries = (0..header.ph_count)
            .map(|index| {
                read_program_header(&mut reader, &header, index)
                    .map_err(ImageError::in_segment(index))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut loader = Self {
            reader,
            header,
            entries,
            next_entry: 0,
            failed: false,
        };
        loader.release_unneeded();
        Ok(loader)
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn entry_address(&self) -> u64 {
        self.header.entry_address
    }

    /// Loadable segments in program-header order.
    ///
    /// The sequence is one-pass: segments already yielded are not produced
    /// again by a later call.
    pub fn segments(&mut self) -> Segments<'_, R> {
        Segments { loader: self }
    }

    /// Release the byte source.
    pub fn close(self) -> R {
        info!(
            "Closing ELF image after {} bytes ({} still buffered)",
            self.reader.position(),
            self.reader.buffered()
        );
        self.reader.into_inner()
    }

    /// Advance to the next loadable entry and read its payload.
    fn next_segment(&mut self) -> Result<Option<Segment>, ImageError> {
        while let Some(&entry) = self.entries.get(self.next_entry) {
            // Bounded by ph_count, which is a u16.
            let index = self.next_entry as u16;
            self.next_entry += 1;

            if entry.p_type != PT_LOAD {
                debug!(
                    "Program header {} (type 0x{:x}) is not loadable",
                    index, entry.p_type
                );
                continue;
            }

            let segment = self
                .read_segment(index, &entry)
                .map_err(ImageError::in_segment(index))?;
            self.release_unneeded();
            return Ok(Some(segment));
        }

        Ok(None)
    }

    fn read_segment(&mut self, index: u16, entry: &ProgramHeader) -> Result<Segment, ImageError> {
        let file_size = size_field("p_filesz", entry.filesz)?;
        let mem_size = size_field("p_memsz", entry.memsz)?;
        if mem_size < file_size {
            return Err(ImageError::MalformedImage(format!(
                "p_memsz 0x{:x} is smaller than p_filesz 0x{:x}",
                mem_size, file_size
            )));
        }

        let mut data = vec![0u8; mem_size];
        self.reader.read_at(entry.offset, &mut data[..file_size])?;

        info!(
            "Program header {} is loadable: vaddr 0x{:x}, filesz 0x{:x}, memsz 0x{:x}",
            index, entry.vaddr, file_size, mem_size
        );

        Ok(Segment {
            index,
            is_loadable: true,
            file_offset: entry.offset,
            virtual_addr: entry.vaddr,
            file_size,
            mem_size,
            data,
        })
    }

    /// Drop buffered bytes that no remaining segment reads.
    fn release_unneeded(&mut self) {
        let lowest = self.entries[self.next_entry..]
            .iter()
            .filter_map(ProgramHeader::payload_start)
            .min()
            .map_or(self.reader.position(), |offset| {
                usize::try_from(offset).unwrap_or(usize::MAX)
            });
        self.reader.release_before(lowest);
    }
}

fn read_program_header<R: Read>(
    reader: &mut StreamReader<R>,
    header: &ImageHeader,
    index: u16,
) -> Result<ProgramHeader, ImageError> {
    let base = u64::from(index)
        .checked_mul(u64::from(header.ph_entry_size))
        .and_then(|rel| rel.checked_add(header.ph_offset))
        .ok_or_else(|| {
            ImageError::MalformedImage("entry lies outside the addressable range".into())
        })?;

    Ok(ProgramHeader {
        p_type: reader.read_u32(base.saturating_add(P_TYPE))?,
        offset: reader.read_u64(base.saturating_add(P_OFFSET))?,
        vaddr: reader.read_u64(base.saturating_add(P_VADDR))?,
        filesz: reader.read_u64(base.saturating_add(P_FILESZ))?,
        memsz: reader.read_u64(base.saturating_add(P_MEMSZ))?,
    })
}

fn size_field(name: &str, raw: u64) -> Result<usize, ImageError> {
    usize::try_from(raw)
        .ok()
        .filter(|&size| size <= MAX_SEGMENT_SIZE)
        .ok_or_else(|| {
            ImageError::MalformedImage(format!(
                "{} 0x{:x} exceeds the 0x{:x} byte limit",
                name, raw, MAX_SEGMENT_SIZE
            ))
        })
}

/// Iterator over the loadable segments of an [`ImageLoader`].
///
/// Stops for good after the first error.
pub struct Segments<'a, R> {
    loader: &'a mut ImageLoader<R>,
}

impl<R: Read> Iterator for Segments<'_, R> {
    type Item = Result<Segment, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.loader.failed {
            return None;
        }

        match self.loader.next_segment() {
            Ok(segment) => segment.map(Ok),
            Err(e) => {
                self.loader.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PT_NOTE: u32 = 4;

    struct Phdr {
        p_type: u32,
        vaddr: u64,
        payload: Vec<u8>,
        mem_size: u64,
    }

    /// Lay out a header, the program header table and then the payloads.
    fn build_image(entry: u64, phdrs: &[Phdr]) -> Vec<u8> {
        let phoff = 0x40u64;
        let mut payload_off = phoff + PHDR64_SIZE as u64 * phdrs.len() as u64;

        let mut img = vec![0u8; payload_off as usize];
        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = ELFCLASS64;
        img[5] = ELFDATA2LSB;
        img[6] = 1;
        img[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
        img[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        img[0x36..0x38].copy_from_slice(&PHDR64_SIZE.to_le_bytes());
        img[0x38..0x3a].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

        for (i, ph) in phdrs.iter().enumerate() {
            let at = (phoff + PHDR64_SIZE as u64 * i as u64) as usize;
            img[at..at + 4].copy_from_slice(&ph.p_type.to_le_bytes());
            img[at + 8..at + 16].copy_from_slice(&payload_off.to_le_bytes());
            img[at + 16..at + 24].copy_from_slice(&ph.vaddr.to_le_bytes());
            img[at + 32..at + 40].copy_from_slice(&(ph.payload.len() as u64).to_le_bytes());
            img[at + 40..at + 48].copy_from_slice(&ph.mem_size.to_le_bytes());
            payload_off += ph.payload.len() as u64;
        }
        for ph in phdrs {
            img.extend_from_slice(&ph.payload);
        }
        img
    }

    fn load(vaddr: u64, payload: &[u8]) -> Phdr {
        Phdr {
            p_type: PT_LOAD,
            vaddr,
            payload: payload.to_vec(),
            mem_size: payload.len() as u64,
        }
    }

    #[test]
    fn test_segments_in_header_order() {
        let img = build_image(
            0x400_0000,
            &[
                load(0x400_0000, &[1, 2, 3, 4]),
                Phdr {
                    p_type: PT_NOTE,
                    vaddr: 0,
                    payload: vec![9; 8],
                    mem_size: 8,
                },
                load(0x0, &[5, 6]),
                load(0x401_0000, &[7]),
            ],
        );

        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        assert_eq!(loader.entry_address(), 0x400_0000);
        assert_eq!(loader.header().ph_count, 4);

        let segments: Vec<Segment> = loader.segments().map(|s| s.unwrap()).collect();
        let indices: Vec<u16> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(segments[0].data, vec![1, 2, 3, 4]);
        assert_eq!(segments[1].virtual_addr, 0x0);
        assert_eq!(segments[1].data, vec![5, 6]);
        assert_eq!(segments[2].data, vec![7]);
        assert!(segments.iter().all(|s| s.is_loadable));

        // One-pass: nothing left after draining.
        assert!(loader.segments().next().is_none());
    }

    #[test]
    fn test_no_loadable_segments() {
        let img = build_image(0, &[]);
        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        assert_eq!(loader.entry_address(), 0);
        assert_eq!(loader.segments().count(), 0);
    }

    #[test]
    fn test_bss_tail_is_zero_filled() {
        let img = build_image(
            0,
            &[Phdr {
                p_type: PT_LOAD,
                vaddr: 0x1000,
                payload: vec![0xde, 0xad, 0xbe, 0xef],
                mem_size: 16,
            }],
        );

        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        let seg = loader.segments().next().unwrap().unwrap();
        assert_eq!(seg.file_size, 4);
        assert_eq!(seg.mem_size, 16);
        assert_eq!(&seg.data[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(seg.data[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_segment_at_file_start() {
        // The first PT_LOAD commonly covers the ELF header itself.
        let mut img = build_image(0, &[load(0x0, &[0; 4])]);
        let len = img.len() as u64;
        img[0x40 + 8..0x40 + 16].copy_from_slice(&0u64.to_le_bytes());
        img[0x40 + 32..0x40 + 40].copy_from_slice(&len.to_le_bytes());
        img[0x40 + 40..0x40 + 48].copy_from_slice(&len.to_le_bytes());

        let mut loader = ImageLoader::open(Cursor::new(img.clone())).unwrap();
        let seg = loader.segments().next().unwrap().unwrap();
        assert_eq!(seg.data, img);
    }

    #[test]
    fn test_rejects_32bit_class() {
        let mut img = build_image(0, &[load(0, &[1])]);
        img[4] = 1;
        let err = ImageLoader::open(Cursor::new(img)).err().unwrap();
        assert!(matches!(err, ImageError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_rejects_big_endian() {
        let mut img = build_image(0, &[load(0, &[1])]);
        img[5] = 2;
        let err = ImageLoader::open(Cursor::new(img)).err().unwrap();
        assert!(matches!(err, ImageError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut img = build_image(0, &[]);
        img[1] = b'X';
        let err = ImageLoader::open(Cursor::new(img)).err().unwrap();
        assert!(matches!(err, ImageError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_memsz_smaller_than_filesz() {
        let img = build_image(
            0,
            &[Phdr {
                p_type: PT_LOAD,
                vaddr: 0,
                payload: vec![1; 8],
                mem_size: 4,
            }],
        );
        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        let mut segments = loader.segments();
        match segments.next() {
            Some(Err(ImageError::Segment { index: 0, source })) => {
                assert!(matches!(*source, ImageError::MalformedImage(_)))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(segments.next().is_none());
    }

    #[test]
    fn test_truncated_payload_names_segment() {
        let mut img = build_image(
            0,
            &[
                load(0x1000, &[1; 16]),
                Phdr {
                    p_type: PT_NOTE,
                    vaddr: 0,
                    payload: Vec::new(),
                    mem_size: 0,
                },
                load(0x2000, &[2; 32]),
            ],
        );
        img.truncate(img.len() - 8);

        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        let mut segments = loader.segments();
        assert_eq!(segments.next().unwrap().unwrap().index, 0);

        let err = segments.next().unwrap().unwrap_err();
        assert_eq!(err.segment_index(), Some(2));
        assert!(err.to_string().starts_with("Program header 2: Malformed image: truncated"));
        match err {
            ImageError::Segment { source, .. } => {
                assert!(matches!(*source, ImageError::MalformedImage(_)))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header_table_names_entry() {
        let mut img = build_image(0, &[load(0x1000, &[]), load(0x2000, &[])]);
        img.truncate(0x40 + PHDR64_SIZE as usize + 0x10);
        let err = ImageLoader::open(Cursor::new(img)).err().unwrap();
        assert_eq!(err.segment_index(), Some(1));
    }

    #[test]
    fn test_loaded_bytes_are_released() {
        let img = build_image(
            0,
            &[load(0x1000, &[1; 0x800]), load(0x2000, &[2; 0x400])],
        );
        let len = img.len();
        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        // Header and table are behind the first payload and already dropped.
        assert_eq!(loader.reader.buffered(), 0);

        let first = loader.segments().next().unwrap().unwrap();
        assert_eq!(first.data.len(), 0x800);
        // The first payload is only kept up to where the second one starts.
        assert_eq!(loader.reader.buffered(), 0);

        assert_eq!(loader.segments().count(), 1);
        assert_eq!(loader.reader.buffered(), 0);
        assert_eq!(loader.reader.position(), len);
    }

    #[test]
    fn test_shared_payload_kept_for_later_segment() {
        let mut img = build_image(0, &[load(0x1000, &[7; 8]), load(0x2000, &[8; 8])]);
        // Both entries point at the first payload.
        let first_off = img[0x40 + 8..0x40 + 16].to_vec();
        let at = 0x40 + PHDR64_SIZE as usize;
        img[at + 8..at + 16].copy_from_slice(&first_off);

        let mut loader = ImageLoader::open(Cursor::new(img)).unwrap();
        let segments: Vec<Segment> = loader.segments().map(|s| s.unwrap()).collect();
        assert_eq!(segments[0].data, vec![7; 8]);
        assert_eq!(segments[1].data, vec![7; 8]);
    }

    #[test]
    fn test_small_phentsize_rejected() {
        let mut img = build_image(0, &[load(0, &[1])]);
        img[0x36..0x38].copy_from_slice(&0x20u16.to_le_bytes());
        let err = ImageLoader::open(Cursor::new(img)).err().unwrap();
        assert!(matches!(err, ImageError::MalformedImage(_)));
    }

    #[test]
    fn test_close_returns_source() {
        let img = build_image(0, &[]);
        let loader = ImageLoader::open(Cursor::new(img)).unwrap();
        let cursor = loader.close();
        assert!(!cursor.get_ref().is_empty());
    }
}
