//! Raw triangle soup files
//!
//! A soup file is a flat run of fixed-size records, one per triangle, with
//! no header and no connectivity: three double-precision corners and a group
//! id.  It is the entry format of the pipeline and the only file a mesh
//! producer has to know how to write.

use crate::error::Error;
use nalgebra::Vector3;
use static_assertions::const_assert_eq;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use zerocopy::byteorder::little_endian::{F64, I32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// On-disk size of one triangle record
pub const SOUP_RECORD_SIZE: usize = 80;

/// One triangle of the soup: three corners and a group id
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SoupRecord {
    coords: [F64; 9],
    _pad: [u8; 4],
    group: I32,
}

const_assert_eq!(std::mem::size_of::<SoupRecord>(), SOUP_RECORD_SIZE);

impl SoupRecord {
    pub fn new(v: &[Vector3<f64>; 3], group: i32) -> Self {
        let mut coords = [F64::new(0.0); 9];
        for (i, p) in v.iter().enumerate() {
            for a in 0..3 {
                coords[3 * i + a] = F64::new(p[a]);
            }
        }
        Self {
            coords,
            _pad: [0; 4],
            group: I32::new(group),
        }
    }

    /// Corner `i` of the triangle, `i < 3`
    pub fn vertex(&self, i: usize) -> Vector3<f64> {
        Vector3::new(
            self.coords[3 * i].get(),
            self.coords[3 * i + 1].get(),
            self.coords[3 * i + 2].get(),
        )
    }

    pub fn group(&self) -> i32 {
        self.group.get()
    }
}

/// Streaming writer for soup files
pub struct SoupWriter {
    out: BufWriter<File>,
}

impl SoupWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
        })
    }

    pub fn add(&mut self, v: &[Vector3<f64>; 3], group: i32) -> Result<(), Error> {
        self.out.write_all(SoupRecord::new(v, group).as_bytes())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

/// Streaming reader for soup files
pub struct SoupReader {
    inp: BufReader<File>,
}

impl SoupReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            inp: BufReader::new(File::open(path)?),
        })
    }

    /// Reads the next record, or `None` at end of file
    pub fn next_record(&mut self) -> Result<Option<SoupRecord>, Error> {
        let mut buf = [0u8; SOUP_RECORD_SIZE];
        if !read_full(&mut self.inp, &mut buf)? {
            return Ok(None);
        }
        let rec = SoupRecord::read_from_bytes(&buf)
            .map_err(|_| Error::BadFormat("bad soup record"))?;
        Ok(Some(rec))
    }
}

/// Fills `buf` from the reader; `Ok(false)` on a clean end of file, an
/// error when the file ends mid-record
pub(crate) fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<bool, Error> {
    let mut n = 0;
    while n < buf.len() {
        let m = r.read(&mut buf[n..])?;
        if m == 0 {
            if n == 0 {
                return Ok(false);
            }
            return Err(Error::BadFormat("truncated record"));
        }
        n += m;
    }
    Ok(true)
}
