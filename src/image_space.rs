use std::{
    io::{self, Read},
    ops::{Deref, DerefMut},
    path::Path,
};

use crate::{
    api::HeapObjectHeader,
    space::{BitmapSpace, GcRetentionPolicy},
    utils::align_usize,
};

pub const IMAGE_MAGIC: [u8; 4] = *b"himg";
pub const IMAGE_VERSION: u32 = 1;

/// On-disk header of a heap image. Object payload follows immediately,
/// densely packed in allocation order.
#[derive(Clone, Copy, Debug)]
pub struct ImageHeader {
    pub version: u32,
    pub image_size: u64,
    pub object_count: u64,
}

impl ImageHeader {
    pub const SIZE: usize = 4 + 4 + 8 + 8;

    fn parse(bytes: &[u8; Self::SIZE]) -> io::Result<Self> {
        if bytes[0..4] != IMAGE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad image magic",
            ));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != IMAGE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported image version {}", version),
            ));
        }
        Ok(Self {
            version,
            image_size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            object_count: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

/// Space populated from an image file at heap creation. Every object in it is
/// permanently live; collections neither sweep nor move it and see references
/// out of it through a mod-union table.
pub struct ImageSpace {
    space: BitmapSpace,
    header: ImageHeader,
}

impl ImageSpace {
    /// Read the image at `path` into the carved-out range starting at
    /// `begin` and pre-mark every object live.
    pub fn load(path: &Path, begin: *mut u8, capacity: usize) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut header_bytes = [0u8; ImageHeader::SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = ImageHeader::parse(&header_bytes)?;

        let image_size = header.image_size as usize;
        if image_size > capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "image of {} bytes does not fit reserved {} bytes",
                    image_size, capacity
                ),
            ));
        }
        let payload = unsafe { std::slice::from_raw_parts_mut(begin, image_size) };
        file.read_exact(payload)?;

        let space = BitmapSpace::create(
            format!("image space ({})", path.display()),
            begin,
            image_size,
            align_usize(capacity, crate::freelist_space::PAGE_SIZE),
            GcRetentionPolicy::NeverCollect,
            false,
        );

        // Objects are densely packed; walk them to populate the live bitmap.
        let mut seen = 0u64;
        unsafe {
            let mut pos = begin;
            let end = begin.add(image_size);
            while pos < end && seen < header.object_count {
                let obj = pos.cast::<HeapObjectHeader>();
                if !(*obj).is_allocated() {
                    break;
                }
                space.live_bitmap().set(pos);
                seen += 1;
                pos = pos.add((*obj).size());
            }
        }
        if seen != header.object_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "image declares {} objects but {} were found",
                    header.object_count, seen
                ),
            ));
        }

        log::info!(
            "loaded image {} ({} objects, {} bytes)",
            path.display(),
            header.object_count,
            image_size
        );

        Ok(Self { space, header })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn objects_allocated(&self) -> usize {
        self.header.object_count as usize
    }
}

/// Dump a densely packed object range as an image file.
pub fn write_image(path: &Path, begin: *const u8, size: usize, object_count: u64) -> io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(&IMAGE_MAGIC)?;
    file.write_all(&IMAGE_VERSION.to_le_bytes())?;
    file.write_all(&(size as u64).to_le_bytes())?;
    file.write_all(&object_count.to_le_bytes())?;
    let payload = unsafe { std::slice::from_raw_parts(begin, size) };
    file.write_all(payload)
}

impl Deref for ImageSpace {
    type Target = BitmapSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for ImageSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}
