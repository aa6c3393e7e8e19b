// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Test-record file format.
//!
//! One record per terminating state. The format is bit exact because
//! downstream replay tooling consumes these files directly: all integers are
//! 32-bit big-endian, strings are length-prefixed without a terminator, and
//! the header magic is either `KTEST` or the legacy `BOUT\n`.
//!
//! Version numbering: 1..29999 are the upstream single-node versions, the
//! 30700 range is the distributed extension, which appends `node_id`,
//! `dscenario_id` and an error string to the upstream layout.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const KTEST_VERSION: u32 = 30701;
pub const KTEST_MAGIC: &[u8; 5] = b"KTEST";
pub const BOUT_MAGIC: &[u8; 5] = b"BOUT\n";

/// Versions below this predate the `sym_argvs`/`sym_argv_len` fields.
const VERSION_WITH_SYM_ARGS: u32 = 2;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("not a test record file (bad magic)")]
    BadMagic,
    #[error("unsupported test record version {0} (current is {KTEST_VERSION})")]
    UnsupportedVersion(u32),
    #[error("test record contains a non-utf8 string")]
    InvalidString,
}

/// A named byte object captured by a test record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KTestObject {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A complete test record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KTest {
    pub version: u32,
    pub args: Vec<String>,
    pub sym_argvs: u32,
    pub sym_argv_len: u32,
    pub objects: Vec<KTestObject>,
    /// Node the terminating state was affiliated with.
    pub node_id: u32,
    /// Distributed scenario the state belonged to.
    pub dscenario_id: u32,
    /// Empty string means the state terminated without an error.
    pub err: String,
}

fn read_string(r: &mut impl Read) -> Result<String> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::InvalidString)
}

fn write_string(w: &mut impl Write, s: &str) -> Result<()> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

impl KTest {
    pub fn new() -> Self {
        KTest {
            version: KTEST_VERSION,
            ..Default::default()
        }
    }

    /// Total number of object bytes in the record.
    pub fn num_bytes(&self) -> usize {
        self.objects.iter().map(|o| o.bytes.len()).sum()
    }

    /// Parse a record. Old versions are accepted, future versions are not.
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 5];
        r.read_exact(&mut magic)?;
        if &magic != KTEST_MAGIC && &magic != BOUT_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = r.read_u32::<BigEndian>()?;
        if version > KTEST_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let num_args = r.read_u32::<BigEndian>()?;
        let mut args = Vec::with_capacity(num_args as usize);
        for _ in 0..num_args {
            args.push(read_string(r)?);
        }

        let (sym_argvs, sym_argv_len) = if version >= VERSION_WITH_SYM_ARGS {
            (r.read_u32::<BigEndian>()?, r.read_u32::<BigEndian>()?)
        } else {
            (0, 0)
        };

        let num_objects = r.read_u32::<BigEndian>()?;
        let mut objects = Vec::with_capacity(num_objects as usize);
        for _ in 0..num_objects {
            let name = read_string(r)?;
            let num_bytes = r.read_u32::<BigEndian>()? as usize;
            let mut bytes = vec![0u8; num_bytes];
            r.read_exact(&mut bytes)?;
            objects.push(KTestObject { name, bytes });
        }

        let node_id = r.read_u32::<BigEndian>()?;
        let dscenario_id = r.read_u32::<BigEndian>()?;
        let err = read_string(r)?;

        Ok(KTest {
            version,
            args,
            sym_argvs,
            sym_argv_len,
            objects,
            node_id,
            dscenario_id,
            err,
        })
    }

    /// Serialise the record. Always writes the current version and magic,
    /// whatever the record was parsed as.
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(KTEST_MAGIC)?;
        w.write_u32::<BigEndian>(KTEST_VERSION)?;

        w.write_u32::<BigEndian>(self.args.len() as u32)?;
        for arg in &self.args {
            write_string(w, arg)?;
        }

        w.write_u32::<BigEndian>(self.sym_argvs)?;
        w.write_u32::<BigEndian>(self.sym_argv_len)?;

        w.write_u32::<BigEndian>(self.objects.len() as u32)?;
        for o in &self.objects {
            write_string(w, &o.name)?;
            w.write_u32::<BigEndian>(o.bytes.len() as u32)?;
            w.write_all(&o.bytes)?;
        }

        w.write_u32::<BigEndian>(self.node_id)?;
        w.write_u32::<BigEndian>(self.dscenario_id)?;
        write_string(w, &self.err)?;
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read(&mut r)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write(&mut w)?;
        w.flush()?;
        Ok(())
    }
}

/// Cheap header probe, useful for directory scans.
pub fn is_ktest_file(path: impl AsRef<Path>) -> bool {
    let mut magic = [0u8; 5];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic == KTEST_MAGIC || &magic == BOUT_MAGIC,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, WriteBytesExt};

    use super::*;

    fn sample() -> KTest {
        KTest {
            version: KTEST_VERSION,
            args: vec!["prog.bc".to_owned(), "--nodes=2".to_owned()],
            sym_argvs: 0,
            sym_argv_len: 0,
            objects: vec![
                KTestObject {
                    name: "buf".to_owned(),
                    bytes: vec![0x41, 0x00, 0xff],
                },
                KTestObject {
                    name: "a{node1:tx1}@2".to_owned(),
                    bytes: vec![7],
                },
            ],
            node_id: 1,
            dscenario_id: 42,
            err: String::new(),
        }
    }

    #[test]
    fn round_trip() {
        let t = sample();
        let mut buf = Vec::new();
        t.write(&mut buf).unwrap();
        let back = KTest::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn exact_layout() {
        let mut t = KTest::new();
        t.node_id = 3;
        t.dscenario_id = 9;
        let mut buf = Vec::new();
        t.write(&mut buf).unwrap();
        let mut expect = Vec::new();
        expect.extend_from_slice(b"KTEST");
        expect.write_u32::<BigEndian>(KTEST_VERSION).unwrap();
        expect.write_u32::<BigEndian>(0).unwrap(); // num_args
        expect.write_u32::<BigEndian>(0).unwrap(); // sym_argvs
        expect.write_u32::<BigEndian>(0).unwrap(); // sym_argv_len
        expect.write_u32::<BigEndian>(0).unwrap(); // num_objects
        expect.write_u32::<BigEndian>(3).unwrap(); // node_id
        expect.write_u32::<BigEndian>(9).unwrap(); // dscenario_id
        expect.write_u32::<BigEndian>(0).unwrap(); // err length
        assert_eq!(buf, expect);
    }

    #[test]
    fn future_version_is_rejected() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        // bump the version field just past current
        buf[5..9].copy_from_slice(&(KTEST_VERSION + 1).to_be_bytes());
        match KTest::read(&mut buf.as_slice()) {
            Err(Error::UnsupportedVersion(v)) => assert_eq!(v, KTEST_VERSION + 1),
            other => panic!("expected version error, got {other:?}"),
        }
    }

    #[test]
    fn legacy_magic_and_old_version() {
        // hand-written version-1 file: no sym_argv fields
        let mut buf = Vec::new();
        buf.extend_from_slice(BOUT_MAGIC);
        buf.write_u32::<BigEndian>(1).unwrap(); // version
        buf.write_u32::<BigEndian>(1).unwrap(); // num_args
        buf.write_u32::<BigEndian>(2).unwrap();
        buf.extend_from_slice(b"go");
        buf.write_u32::<BigEndian>(0).unwrap(); // num_objects
        buf.write_u32::<BigEndian>(5).unwrap(); // node_id
        buf.write_u32::<BigEndian>(0).unwrap(); // dscenario_id
        buf.write_u32::<BigEndian>(0).unwrap(); // err
        let t = KTest::read(&mut buf.as_slice()).unwrap();
        assert_eq!(t.version, 1);
        assert_eq!(t.args, vec!["go".to_owned()]);
        assert_eq!(t.sym_argvs, 0);
        assert_eq!(t.node_id, 5);
    }

    #[test]
    fn bad_magic() {
        let buf = b"NOPE!aaaa".to_vec();
        assert!(matches!(
            KTest::read(&mut buf.as_slice()),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.ktest");
        sample().to_file(&good).unwrap();
        assert!(is_ktest_file(&good));
        let bad = dir.path().join("b.ktest");
        std::fs::write(&bad, b"garbage").unwrap();
        assert!(!is_ktest_file(&bad));
        assert_eq!(KTest::from_file(&good).unwrap().num_bytes(), 4);
    }
}
