//! Places the loadable segments of an ELF image into guest memory.

use crate::error::{Error, Result};
use crate::memory::MemoryLayout;
use crate::transcript::{record, OutputSink};
use elf_image::ImageLoader;
use std::io::Read;

/// Copy every loadable segment of the image into `layout` and return the
/// entry address.
///
/// Stops at the first segment that fails; the error names the segment and,
/// where one was resolved, the region it was matched with. The byte source is
/// closed once the segments are drained. No region is created here.
pub fn load_image<R: Read>(
    source: R,
    layout: &mut MemoryLayout,
    sink: &mut dyn OutputSink,
) -> Result<u64> {
    let mut image = ImageLoader::open(source)?;
    let entry = image.entry_address();
    record!(
        sink,
        Info,
        "Image entry 0x{:x}, {} program headers",
        entry,
        image.header().ph_count
    );

    let mut loaded = 0usize;
    for segment in image.segments() {
        let segment = segment?;
        let wrap = |source| Error::Segment {
            index: segment.index,
            vaddr: segment.virtual_addr,
            size: segment.mem_size,
            source,
        };

        let handle = layout.find(segment.virtual_addr).map_err(wrap)?;
        layout
            .copy_into(handle, &segment.data, segment.virtual_addr)
            .map_err(wrap)?;

        let region = layout.region(handle);
        record!(
            sink,
            Info,
            "Loaded segment {} (0x{:x} bytes, 0x{:x} from file) at 0x{:x} into '{}' +0x{:x}",
            segment.index,
            segment.mem_size,
            segment.file_size,
            segment.virtual_addr,
            region.name(),
            segment.virtual_addr - region.guest_phys_addr()
        );
        loaded += 1;
    }

    image.close();
    record!(sink, Info, "Closed image after loading {} segments", loaded);
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::memory::RegionFlags;
    use crate::transcript::Transcript;
    use std::io::Cursor;

    /// Minimal ELF64 with one PT_LOAD per `(vaddr, bytes, mem_size)`.
    fn image(entry: u64, segments: &[(u64, &[u8], u64)]) -> Vec<u8> {
        let phoff = 0x40u64;
        let mut data_off = phoff + 0x38 * segments.len() as u64;
        let mut img = vec![0u8; data_off as usize];
        img[..4].copy_from_slice(b"\x7fELF");
        img[4] = 2;
        img[5] = 1;
        img[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
        img[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        img[0x36..0x38].copy_from_slice(&0x38u16.to_le_bytes());
        img[0x38..0x3a].copy_from_slice(&(segments.len() as u16).to_le_bytes());
        for (i, (vaddr, bytes, mem_size)) in segments.iter().enumerate() {
            let at = 0x40 + 0x38 * i;
            img[at..at + 4].copy_from_slice(&1u32.to_le_bytes());
            img[at + 8..at + 16].copy_from_slice(&data_off.to_le_bytes());
            img[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
            img[at + 32..at + 40].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
            img[at + 40..at + 48].copy_from_slice(&mem_size.to_le_bytes());
            data_off += bytes.len() as u64;
        }
        for (_, bytes, _) in segments {
            img.extend_from_slice(bytes);
        }
        img
    }

    fn layout() -> MemoryLayout {
        let mut layout = MemoryLayout::new();
        layout
            .register("rom", 0x0, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();
        layout
            .register("ram", 0x0400_0000, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();
        layout
    }

    #[test]
    fn test_loads_segments_into_matching_regions() {
        let mut layout = layout();
        let mut transcript = Transcript::new();
        let img = image(
            0x10,
            &[(0x10, &[1, 2, 3, 4], 4), (0x0400_0100, &[9, 8], 2)],
        );

        let entry = load_image(Cursor::new(img), &mut layout, &mut transcript).unwrap();
        assert_eq!(entry, 0x10);

        let mut rom = [0u8; 4];
        layout.read(layout.find(0x0).unwrap(), 0x10, &mut rom).unwrap();
        assert_eq!(rom, [1, 2, 3, 4]);

        let mut ram = [0u8; 2];
        layout
            .read(layout.find(0x0400_0000).unwrap(), 0x100, &mut ram)
            .unwrap();
        assert_eq!(ram, [9, 8]);
        assert!(transcript
            .lines()
            .iter()
            .any(|l| l.contains("after loading 2 segments")));
    }

    #[test]
    fn test_bss_tail_zeroed_in_region() {
        let mut layout = layout();
        let ram = layout.find(0x0400_0000).unwrap();
        layout.copy_into(ram, &[0xff; 32], 0x0400_0000).unwrap();

        let img = image(0, &[(0x0400_0000, &[0xaa, 0xbb, 0xcc, 0xdd], 16)]);
        load_image(Cursor::new(img), &mut layout, &mut Transcript::new()).unwrap();

        let mut back = [0u8; 20];
        layout.read(ram, 0, &mut back).unwrap();
        assert_eq!(&back[..4], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&back[4..16], &[0u8; 12]);
        assert_eq!(&back[16..], &[0xff; 4]);
    }

    #[test]
    fn test_segment_too_large_for_region() {
        let mut layout = layout();
        let payload = vec![0x11u8; 0x20];
        let img = image(0, &[(0x10, &[0], 1), (0x0400_0ff0, payload.as_slice(), 0x20)]);

        let err = load_image(Cursor::new(img), &mut layout, &mut Transcript::new()).unwrap_err();
        match err {
            Error::Segment {
                index,
                vaddr,
                source: MemoryError::OutOfBounds { region_base, .. },
                ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(vaddr, 0x0400_0ff0);
                assert_eq!(region_base, 0x0400_0000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_segment_without_mapping() {
        let mut layout = MemoryLayout::new();
        layout
            .register("ram", 0x0400_0000, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();
        let img = image(0, &[(0x100, &[1], 1)]);

        let err = load_image(Cursor::new(img), &mut layout, &mut Transcript::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Segment {
                index: 0,
                source: MemoryError::NoMapping(0x100),
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_later_segment_is_named() {
        let mut layout = layout();
        let mut transcript = Transcript::new();
        let mut img = image(0, &[(0x10, &[1, 2], 2), (0x0400_0000, &[3; 16], 16)]);
        img.truncate(img.len() - 8);

        let err = load_image(Cursor::new(img), &mut layout, &mut transcript).unwrap_err();
        assert!(matches!(
            err,
            Error::Image(elf_image::ImageError::Segment { index: 1, .. })
        ));
        assert_eq!(err.segment_index(), Some(1));
        // The first segment was in place before the failure.
        assert!(transcript
            .lines()
            .iter()
            .any(|l| l.starts_with("Loaded segment 0")));
    }

    #[test]
    fn test_unsupported_image() {
        let mut img = image(0, &[]);
        img[4] = 1;
        let err = load_image(Cursor::new(img), &mut layout(), &mut Transcript::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Image(elf_image::ImageError::UnsupportedFormat(_))
        ));
    }
}
