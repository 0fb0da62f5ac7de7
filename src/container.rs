use std::cell::{Cell, RefCell};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use crc32fast::Hasher as Crc32;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::checksum::{HashMatch, compare_files, hash_stream, hash_targets};
use crate::config::Config;
use crate::types::{Checksum, ChecksumSet};

const LOCAL_SIGNATURE: u32 = 0x04034b50;
const CENTRAL_SIGNATURE: u32 = 0x02014b50;
const EOCD_SIGNATURE: u32 = 0x06054b50;
const LOCAL_HEADER_LEN: usize = 30;
const EOCD_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = 0xffff;

const FLAG_MAX_COMPRESSION: u16 = 0x0002;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const FLAG_UTF8: u16 = 0x0800;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;
const VERSION_DEFLATE: u16 = 20;
// 1996-12-24 23:32, the TorrentZip timestamp
const DOS_TIME: u16 = 0xbc00;
const DOS_DATE: u16 = 0x2198;

/// Code page 437, the encoding of names without the UTF-8 flag.
const CP437_TABLE: [char; 256] = [
    '\u{0000}', '\u{0001}', '\u{0002}', '\u{0003}', '\u{0004}', '\u{0005}', '\u{0006}', '\u{0007}',
    '\u{0008}', '\u{0009}', '\u{000A}', '\u{000B}', '\u{000C}', '\u{000D}', '\u{000E}', '\u{000F}',
    '\u{0010}', '\u{0011}', '\u{0012}', '\u{0013}', '\u{0014}', '\u{0015}', '\u{0016}', '\u{0017}',
    '\u{0018}', '\u{0019}', '\u{001A}', '\u{001B}', '\u{001C}', '\u{001D}', '\u{001E}', '\u{001F}',
    ' ', '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', '0', '1', '2',
    '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', '@', 'A', 'B', 'C', 'D', 'E',
    'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X',
    'Y', 'Z', '[', '\\', ']', '^', '_', '`', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k',
    'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '{', '|', '}', '~',
    '\u{007F}', '\u{00C7}', '\u{00FC}', '\u{00E9}', '\u{00E2}', '\u{00E4}', '\u{00E0}', '\u{00E5}',
    '\u{00E7}', '\u{00EA}', '\u{00EB}', '\u{00E8}', '\u{00EF}', '\u{00EE}', '\u{00EC}', '\u{00C4}',
    '\u{00C5}', '\u{00C9}', '\u{00E6}', '\u{00C6}', '\u{00F4}', '\u{00F6}', '\u{00F2}', '\u{00FB}',
    '\u{00F9}', '\u{00FF}', '\u{00D6}', '\u{00DC}', '\u{00A2}', '\u{00A3}', '\u{00A5}', '\u{20A7}',
    '\u{0192}', '\u{00E1}', '\u{00ED}', '\u{00F3}', '\u{00FA}', '\u{00F1}', '\u{00D1}', '\u{00AA}',
    '\u{00BA}', '\u{00BF}', '\u{2310}', '\u{00AC}', '\u{00BD}', '\u{00BC}', '\u{00A1}', '\u{00AB}',
    '\u{00BB}', '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}',
    '\u{2556}', '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255D}', '\u{255C}', '\u{255B}',
    '\u{2510}', '\u{2514}', '\u{2534}', '\u{252C}', '\u{251C}', '\u{2500}', '\u{253C}', '\u{255E}',
    '\u{255F}', '\u{255A}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256C}',
    '\u{2567}', '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}',
    '\u{256B}', '\u{256A}', '\u{2518}', '\u{250C}', '\u{2588}', '\u{2584}', '\u{258C}', '\u{2590}',
    '\u{2580}', '\u{03B1}', '\u{00DF}', '\u{0393}', '\u{03C0}', '\u{03A3}', '\u{03C3}', '\u{00B5}',
    '\u{03C4}', '\u{03A6}', '\u{0398}', '\u{03A9}', '\u{03B4}', '\u{221E}', '\u{03C6}', '\u{03B5}',
    '\u{2229}', '\u{2261}', '\u{00B1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00F7}',
    '\u{2248}', '\u{00B0}', '\u{2219}', '\u{00B7}', '\u{221A}', '\u{207F}', '\u{00B2}', '\u{25A0}',
    '\u{00A0}',
];

/// Little-endian cursor over an in-memory record.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| anyhow!("record truncated at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn position(&self) -> usize {
        self.pos
    }
}

/// Header fields of one entry as stored in the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub version_made: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mtime: u16,
    pub mdate: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
    pub disk_start: u16,
    pub internal_attr: u16,
    pub external_attr: u32,
    pub local_offset: u32,
}

impl EntryHeader {
    fn fresh(name: &str, crc32: u32, size: u32) -> Self {
        EntryHeader {
            version_made: VERSION_DEFLATE,
            version_needed: VERSION_DEFLATE,
            flags: FLAG_MAX_COMPRESSION | utf8_flag(name),
            method: METHOD_DEFLATED,
            mtime: DOS_TIME,
            mdate: DOS_DATE,
            crc32,
            compressed_size: 0,
            uncompressed_size: size,
            name: name.as_bytes().to_vec(),
            extra: Vec::new(),
            comment: Vec::new(),
            disk_start: 0,
            internal_attr: 0,
            external_attr: 0,
            local_offset: 0,
        }
    }

    fn read_central(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        if r.u32()? != CENTRAL_SIGNATURE {
            bail!("bad central directory signature at byte {}", r.position() - 4);
        }
        let version_made = r.u16()?;
        let version_needed = r.u16()?;
        let flags = r.u16()?;
        let method = r.u16()?;
        let mtime = r.u16()?;
        let mdate = r.u16()?;
        let crc32 = r.u32()?;
        let compressed_size = r.u32()?;
        let uncompressed_size = r.u32()?;
        let name_len = r.u16()? as usize;
        let extra_len = r.u16()? as usize;
        let comment_len = r.u16()? as usize;
        let disk_start = r.u16()?;
        let internal_attr = r.u16()?;
        let external_attr = r.u32()?;
        let local_offset = r.u32()?;
        let name = r.take(name_len)?.to_vec();
        let extra = r.take(extra_len)?.to_vec();
        let comment = r.take(comment_len)?.to_vec();

        if compressed_size == u32::MAX || uncompressed_size == u32::MAX || local_offset == u32::MAX
        {
            bail!("zip64 entries are not supported");
        }

        Ok(EntryHeader {
            version_made,
            version_needed,
            flags,
            method,
            mtime,
            mdate,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra,
            comment,
            disk_start,
            internal_attr,
            external_attr,
            local_offset,
        })
    }

    fn local_record(&self, extra: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOCAL_HEADER_LEN + self.name.len() + extra.len());
        out.extend_from_slice(&LOCAL_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.version_needed.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.mdate.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(extra);
        out
    }

    fn central_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(46 + self.name.len() + self.extra.len());
        out.extend_from_slice(&CENTRAL_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.version_made.to_le_bytes());
        out.extend_from_slice(&self.version_needed.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.mdate.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.extra.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.disk_start.to_le_bytes());
        out.extend_from_slice(&self.internal_attr.to_le_bytes());
        out.extend_from_slice(&self.external_attr.to_le_bytes());
        out.extend_from_slice(&self.local_offset.to_le_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.comment);
        out
    }

    /// Whether a local header describes the same entry. Sizes and CRC are
    /// skipped when they live in a trailing data descriptor.
    fn agrees_with_local(&self, local: &EntryHeader) -> bool {
        let same_fields = self.version_needed == local.version_needed
            && self.flags == local.flags
            && self.method == local.method
            && self.mtime == local.mtime
            && self.mdate == local.mdate
            && self.name == local.name;
        if !same_fields {
            return false;
        }
        self.flags & FLAG_DATA_DESCRIPTOR != 0
            || (self.crc32 == local.crc32
                && self.compressed_size == local.compressed_size
                && self.uncompressed_size == local.uncompressed_size)
    }

    fn decoded_name(&self) -> String {
        decode_name(&self.name, self.flags)
    }

    fn rename(&mut self, name: &str) {
        self.name = name.as_bytes().to_vec();
        self.flags = (self.flags & !FLAG_UTF8) | utf8_flag(name);
    }
}

fn utf8_flag(name: &str) -> u16 {
    if name.is_ascii() { 0 } else { FLAG_UTF8 }
}

/// Decodes a stored name. Names without the UTF-8 flag are taken as UTF-8
/// when they are valid UTF-8 and as code page 437 otherwise.
fn decode_name(raw: &[u8], flags: u16) -> String {
    if flags & FLAG_UTF8 != 0 {
        return String::from_utf8_lossy(raw).into_owned();
    }
    match std::str::from_utf8(raw) {
        Ok(name) => name.to_string(),
        Err(_) => raw.iter().map(|&b| CP437_TABLE[b as usize]).collect(),
    }
}

fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    handle.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads the local header at `offset`, returning it and the payload offset.
fn read_local_header<R: Read + Seek>(
    source: &mut R,
    offset: u64,
) -> anyhow::Result<(EntryHeader, u64)> {
    source.seek(SeekFrom::Start(offset))?;
    let mut fixed = [0u8; LOCAL_HEADER_LEN];
    source
        .read_exact(&mut fixed)
        .with_context(|| format!("reading local header at {offset}"))?;
    let mut r = FieldReader::new(&fixed);
    if r.u32()? != LOCAL_SIGNATURE {
        bail!("bad local header signature at {offset}");
    }
    let version_needed = r.u16()?;
    let flags = r.u16()?;
    let method = r.u16()?;
    let mtime = r.u16()?;
    let mdate = r.u16()?;
    let crc32 = r.u32()?;
    let compressed_size = r.u32()?;
    let uncompressed_size = r.u32()?;
    let name_len = r.u16()? as usize;
    let extra_len = r.u16()? as usize;
    let mut variable = vec![0u8; name_len + extra_len];
    source
        .read_exact(&mut variable)
        .with_context(|| format!("reading local header name at {offset}"))?;
    let extra = variable.split_off(name_len);

    let header = EntryHeader {
        version_made: 0,
        version_needed,
        flags,
        method,
        mtime,
        mdate,
        crc32,
        compressed_size,
        uncompressed_size,
        name: variable,
        extra,
        comment: Vec::new(),
        disk_start: 0,
        internal_attr: 0,
        external_attr: 0,
        local_offset: u32::try_from(offset).unwrap_or(u32::MAX),
    };
    let data_offset = offset + (LOCAL_HEADER_LEN + name_len + extra_len) as u64;
    Ok((header, data_offset))
}

/// Positions `source` at the payload described by `header` and wraps a decoder around it.
fn open_payload<'a, R: Read + Seek + 'a>(
    mut source: R,
    header: &EntryHeader,
) -> anyhow::Result<Box<dyn Read + 'a>> {
    let (_, data_offset) = read_local_header(&mut source, header.local_offset as u64)?;
    source.seek(SeekFrom::Start(data_offset))?;
    let raw = source.take(header.compressed_size as u64);
    match header.method {
        METHOD_STORED => Ok(Box::new(raw)),
        METHOD_DEFLATED => Ok(Box::new(DeflateDecoder::new(raw))),
        other => bail!("unsupported compression method {other}"),
    }
}

/// Copies the stored payload bytes of `header` verbatim.
fn copy_raw_payload<R: Read + Seek, W: Write>(
    mut source: R,
    header: &EntryHeader,
    out: &mut W,
) -> anyhow::Result<()> {
    let (_, data_offset) = read_local_header(&mut source, header.local_offset as u64)?;
    source.seek(SeekFrom::Start(data_offset))?;
    let expected = header.compressed_size as u64;
    let copied = io::copy(&mut (&mut source).take(expected), out)?;
    if copied != expected {
        bail!("payload truncated: copied {copied} of {expected} bytes");
    }
    Ok(())
}

fn crc_of<R: Read>(mut reader: R) -> anyhow::Result<(u32, u64)> {
    let mut hasher = Crc32::new();
    let mut len = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((hasher.finalize(), len))
}

/// Limits how many bytes reach the inner writer, failing once exhausted.
struct BudgetWriter<W> {
    inner: W,
    remaining: Option<u64>,
}

impl<W: Write> Write for BudgetWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(remaining) = self.remaining else {
            return self.inner.write(buf);
        };
        if remaining == 0 {
            return Err(io::Error::other("write budget exhausted"));
        }
        let allowed = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.inner.write(&buf[..allowed])?;
        self.remaining = Some(remaining - n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unchanged,
    Added,
    Renamed,
    Deleted,
}

/// Where the payload of an added entry comes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    Bytes(Vec<u8>),
    File(PathBuf),
    /// Raw copy of an entry in another (or the same) archive.
    Entry { archive: PathBuf, header: EntryHeader },
}

#[derive(Debug)]
pub struct Entry {
    header: EntryHeader,
    name: String,
    state: EntryState,
    source: Option<DataSource>,
    broken: Cell<bool>,
    checksums: RefCell<Option<ChecksumSet>>,
}

impl Entry {
    fn loaded(header: EntryHeader) -> Self {
        Entry {
            name: header.decoded_name(),
            header,
            state: EntryState::Unchanged,
            source: None,
            broken: Cell::new(false),
            checksums: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.header.uncompressed_size as u64
    }

    pub fn crc32(&self) -> u32 {
        self.header.crc32
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state != EntryState::Deleted
    }

    pub fn is_broken(&self) -> bool {
        self.broken.get()
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    /// Checksums known without decompressing.
    pub fn toc_checksums(&self) -> ChecksumSet {
        ChecksumSet::from_crc32(self.header.crc32)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// A missing file opens as an empty container.
    pub create: bool,
    pub check_integrity: bool,
}

/// A ZIP archive holding one game's files, with staged changes.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    file: Option<File>,
    entries: Vec<Entry>,
    loaded: usize,
    comment: Vec<u8>,
    cd_offset: u64,
    hash_types: Vec<Checksum>,
    match_types: Vec<Checksum>,
    quick: bool,
    write_budget: Option<u64>,
    verbose: u8,
}

impl Container {
    pub fn open(path: &Path, flags: OpenFlags, config: &Config) -> anyhow::Result<Self> {
        let mut container = Container {
            path: path.to_path_buf(),
            file: None,
            entries: Vec::new(),
            loaded: 0,
            comment: Vec::new(),
            cd_offset: 0,
            hash_types: hash_targets(config),
            match_types: config.hash_types(),
            quick: config.checksum_quick,
            write_budget: None,
            verbose: config.verbose,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound && flags.create => {
                return Ok(container);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("opening container: {path:?}"));
            }
        };
        container
            .load(file)
            .with_context(|| format!("reading container: {path:?}"))?;
        if flags.check_integrity {
            container.check_integrity();
        }
        Ok(container)
    }

    fn load(&mut self, file: File) -> anyhow::Result<()> {
        let len = file.metadata()?.len();
        let tail_len = len.min((EOCD_LEN + MAX_COMMENT_LEN) as u64) as usize;
        let tail_start = len - tail_len as u64;
        let tail = read_at(&file, tail_start, tail_len)?;

        // Try end records from the back; the first self-consistent one wins.
        let signature = EOCD_SIGNATURE.to_le_bytes();
        let mut last_error = None;
        let mut end = tail.len();
        while let Some(pos) = tail[..end].windows(4).rposition(|w| *w == signature) {
            end = pos + 3;
            match self.read_directory(&file, &tail[pos..], tail_start + pos as u64) {
                Ok(()) => {
                    self.file = Some(file);
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no end of central directory record")))
    }

    fn read_directory(
        &mut self,
        file: &File,
        record: &[u8],
        record_offset: u64,
    ) -> anyhow::Result<()> {
        let mut r = FieldReader::new(record);
        r.u32()?;
        let disk = r.u16()?;
        let cd_disk = r.u16()?;
        let entries_on_disk = r.u16()?;
        let entries_total = r.u16()?;
        let cd_size = r.u32()? as u64;
        let cd_offset = r.u32()? as u64;
        let comment_len = r.u16()? as usize;

        if record.len() != EOCD_LEN + comment_len {
            bail!(
                "archive comment length {comment_len} disagrees with {} trailing bytes",
                record.len() - EOCD_LEN.min(record.len())
            );
        }
        if disk != 0 || cd_disk != 0 || entries_on_disk != entries_total {
            bail!("multi-disk archives are not supported");
        }
        if cd_offset + cd_size != record_offset {
            bail!("central directory ({cd_offset}+{cd_size}) does not end at {record_offset}");
        }

        let cd = read_at(file, cd_offset, cd_size as usize)?;
        let mut r = FieldReader::new(&cd);
        let mut entries = Vec::with_capacity(entries_total as usize);
        for _ in 0..entries_total {
            entries.push(Entry::loaded(EntryHeader::read_central(&mut r)?));
        }
        if r.position() != cd.len() {
            bail!(
                "central directory holds {} bytes but {entries_total} entries use {}",
                cd.len(),
                r.position()
            );
        }

        self.loaded = entries.len();
        self.entries = entries;
        self.comment = record[EOCD_LEN..].to_vec();
        self.cd_offset = cd_offset;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an archive file backs this container.
    pub fn exists(&self) -> bool {
        self.file.is_some()
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Live entries with their stable indices.
    pub fn list(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_live())
    }

    pub fn len(&self) -> usize {
        self.list().count()
    }

    pub fn is_empty(&self) -> bool {
        self.list().next().is_none()
    }

    pub fn entry(&self, idx: usize) -> anyhow::Result<&Entry> {
        self.entries
            .get(idx)
            .ok_or_else(|| anyhow!("no entry {idx} in {:?}", self.path))
    }

    pub fn find_name(&self, name: &str) -> Option<usize> {
        self.list()
            .find(|(_, entry)| entry.name == name)
            .map(|(idx, _)| idx)
    }

    fn file(&self) -> anyhow::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| anyhow!("container {:?} has no archive on disk", self.path))
    }

    /// Decompressing reader over an entry's payload.
    pub fn reader(&self, idx: usize) -> anyhow::Result<Box<dyn Read + '_>> {
        let entry = self.entry(idx)?;
        match &entry.source {
            Some(DataSource::Bytes(data)) => Ok(Box::new(data.as_slice())),
            Some(DataSource::File(path)) => Ok(Box::new(
                File::open(path).with_context(|| format!("opening source {path:?}"))?,
            )),
            Some(DataSource::Entry { archive, header }) => {
                let file =
                    File::open(archive).with_context(|| format!("opening source {archive:?}"))?;
                open_payload(file, header)
            }
            None => open_payload(self.file()?, &entry.header),
        }
    }

    pub fn read(&self, idx: usize) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.reader(idx)?
            .read_to_end(&mut data)
            .with_context(|| format!("decompressing entry {idx} of {:?}", self.path))?;
        Ok(data)
    }

    /// Full checksums of an entry, computed on first use and cached.
    /// Quick mode only returns what the directory records.
    pub fn checksums(&self, idx: usize) -> anyhow::Result<ChecksumSet> {
        let entry = self.entry(idx)?;
        if let Some(cached) = entry.checksums.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let toc = entry.toc_checksums();
        if self.quick || self.hash_types.iter().all(|kind| *kind == Checksum::Crc32) {
            return Ok(toc);
        }
        let (mut sums, _) = hash_stream(self.reader(idx)?, &self.hash_types)
            .with_context(|| format!("hashing {} in {:?}", entry.name, self.path))?;
        sums.merge_missing(&toc);
        *entry.checksums.borrow_mut() = Some(sums.clone());
        Ok(sums)
    }

    /// Compares an entry with an expected size and checksums. Entries whose
    /// payload cannot be read are marked broken and never match.
    pub fn compare(
        &self,
        idx: usize,
        size: Option<u64>,
        expected: &ChecksumSet,
    ) -> anyhow::Result<HashMatch> {
        let entry = self.entry(idx)?;
        if entry.is_broken() {
            return Ok(HashMatch::Mismatch);
        }
        let toc = entry.toc_checksums();
        let from_toc = compare_files(Some(entry.size()), &toc, size, expected, &self.match_types);
        if from_toc == HashMatch::Mismatch {
            return Ok(HashMatch::Mismatch);
        }
        let needs_payload = !self.quick
            && self
                .match_types
                .iter()
                .any(|kind| *kind != Checksum::Crc32 && expected.get(*kind).is_some());
        if !needs_payload {
            return Ok(from_toc);
        }
        match self.checksums(idx) {
            Ok(actual) => Ok(compare_files(
                Some(entry.size()),
                &actual,
                size,
                expected,
                &self.match_types,
            )),
            Err(_) => {
                entry.broken.set(true);
                Ok(HashMatch::Mismatch)
            }
        }
    }

    pub fn matches(
        &self,
        idx: usize,
        size: Option<u64>,
        expected: &ChecksumSet,
    ) -> anyhow::Result<bool> {
        Ok(self.compare(idx, size, expected)?.is_acceptable())
    }

    /// Validates every entry's local header and payload; returns how many are broken.
    pub fn check_integrity(&self) -> usize {
        let mut broken = 0;
        for idx in 0..self.loaded {
            if !matches!(self.verify_entry(idx), Ok(true)) {
                self.entries[idx].broken.set(true);
                broken += 1;
            }
        }
        broken
    }

    fn verify_entry(&self, idx: usize) -> anyhow::Result<bool> {
        let entry = self.entry(idx)?;
        let mut file = self.file()?;
        let (local, data_offset) = read_local_header(&mut file, entry.header.local_offset as u64)?;
        if !entry.header.agrees_with_local(&local) {
            return Ok(false);
        }
        if data_offset + entry.header.compressed_size as u64 > self.cd_offset {
            return Ok(false);
        }
        let (sums, len) = hash_stream(self.reader(idx)?, &self.hash_types)?;
        if len != entry.size() || sums.crc32 != Some(format!("{:08x}", entry.crc32())) {
            return Ok(false);
        }
        *entry.checksums.borrow_mut() = Some(sums);
        Ok(true)
    }

    /// Stages a new entry. Fails if a live entry already has `name`.
    pub fn add(&mut self, name: &str, source: DataSource) -> anyhow::Result<usize> {
        if self.find_name(name).is_some() {
            bail!("entry {name} already exists in {:?}", self.path);
        }
        let header = match &source {
            DataSource::Bytes(data) => {
                EntryHeader::fresh(name, crc32fast::hash(data), zip32_size(data.len() as u64)?)
            }
            DataSource::File(path) => {
                let file = File::open(path).with_context(|| format!("opening source {path:?}"))?;
                let (crc, len) = crc_of(file).with_context(|| format!("reading {path:?}"))?;
                EntryHeader::fresh(name, crc, zip32_size(len)?)
            }
            DataSource::Entry { header, .. } => {
                let mut copied = header.clone();
                copied.rename(name);
                copied.flags &= !FLAG_DATA_DESCRIPTOR;
                copied.extra.clear();
                copied
            }
        };
        self.entries.push(Entry {
            header,
            name: name.to_string(),
            state: EntryState::Added,
            source: Some(source),
            broken: Cell::new(false),
            checksums: RefCell::new(None),
        });
        Ok(self.entries.len() - 1)
    }

    /// Stages a rename. Fails if another live entry already has `name`.
    pub fn rename(&mut self, idx: usize, name: &str) -> anyhow::Result<()> {
        if let Some(existing) = self.find_name(name) {
            if existing == idx {
                return Ok(());
            }
            bail!("entry {name} already exists in {:?}", self.path);
        }
        let path = self.path.clone();
        let entry = self
            .entries
            .get_mut(idx)
            .ok_or_else(|| anyhow!("no entry {idx} in {path:?}"))?;
        match entry.state {
            EntryState::Deleted => bail!("entry {} in {path:?} is deleted", entry.name),
            EntryState::Added => {}
            EntryState::Unchanged | EntryState::Renamed => {
                entry.state = if entry.header.decoded_name() == name {
                    EntryState::Unchanged
                } else {
                    EntryState::Renamed
                };
            }
        }
        entry.name = name.to_string();
        Ok(())
    }

    pub fn delete(&mut self, idx: usize) -> anyhow::Result<()> {
        let path = self.path.clone();
        let entry = self
            .entries
            .get_mut(idx)
            .ok_or_else(|| anyhow!("no entry {idx} in {path:?}"))?;
        entry.state = EntryState::Deleted;
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.state != EntryState::Unchanged)
    }

    /// Discards every staged change.
    pub fn rollback(&mut self) {
        self.entries.truncate(self.loaded);
        for entry in &mut self.entries {
            entry.name = entry.header.decoded_name();
            entry.state = EntryState::Unchanged;
        }
    }

    /// Limits how many bytes the next commits may write; `None` removes the limit.
    pub fn set_write_budget(&mut self, bytes: Option<u64>) {
        self.write_budget = bytes;
    }

    /// Writes staged changes to a temporary file and renames it over the
    /// archive. On error the archive on disk is untouched and the staged
    /// changes remain for the caller to roll back. Returns whether anything
    /// was written.
    pub fn commit(&mut self) -> anyhow::Result<bool> {
        if !self.has_changes() {
            return Ok(false);
        }

        if self.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)
                    .with_context(|| format!("removing empty container: {:?}", self.path))?;
            }
            self.file = None;
            self.entries.clear();
            self.loaded = 0;
            self.comment.clear();
            self.cd_offset = 0;
            return Ok(true);
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating directory: {dir:?}"))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".romcheck-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .with_context(|| format!("creating temporary file in {dir:?}"))?;
        {
            let mut out = BudgetWriter {
                inner: BufWriter::new(temp.as_file_mut()),
                remaining: self.write_budget,
            };
            self.write_archive(&mut out)
                .with_context(|| format!("writing container: {:?}", self.path))?;
            out.flush()
                .with_context(|| format!("writing container: {:?}", self.path))?;
        }
        temp.as_file()
            .sync_all()
            .with_context(|| format!("syncing container: {:?}", self.path))?;
        temp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("replacing container: {:?}", self.path))?;

        // The archive is already replaced; only warn if it cannot be read back.
        self.reload();
        Ok(true)
    }

    /// Reads the committed archive again. On failure the container is left
    /// empty and `false` is returned.
    fn reload(&mut self) -> bool {
        self.file = None;
        let reloaded = File::open(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|file| self.load(file));
        match reloaded {
            Ok(()) => true,
            Err(err) => {
                vprintln!(
                    self.verbose,
                    0,
                    "warning: committed {:?} but could not read it back: {err:#}",
                    self.path
                );
                self.entries.clear();
                self.loaded = 0;
                false
            }
        }
    }

    fn write_archive<W: Write>(&self, out: &mut W) -> anyhow::Result<()> {
        let mut offset: u64 = 0;
        let mut central = Vec::new();
        let mut count: usize = 0;

        for (idx, entry) in self.list() {
            let mut header = entry.header.clone();
            header.local_offset = u32::try_from(offset)
                .map_err(|_| anyhow!("container exceeds the 4 GiB zip limit"))?;
            header.flags &= !FLAG_DATA_DESCRIPTOR;
            if header.decoded_name() != entry.name {
                header.rename(&entry.name);
            }

            match &entry.source {
                None => {
                    let mut file = self.file()?;
                    let (local, _) =
                        read_local_header(&mut file, entry.header.local_offset as u64)?;
                    let record = header.local_record(&local.extra);
                    out.write_all(&record)?;
                    copy_raw_payload(file, &entry.header, out)
                        .with_context(|| format!("copying {}", entry.name))?;
                    offset += (record.len() as u64) + header.compressed_size as u64;
                }
                Some(DataSource::Entry { archive, header: source }) => {
                    let file = File::open(archive)
                        .with_context(|| format!("opening source {archive:?}"))?;
                    let record = header.local_record(&[]);
                    out.write_all(&record)?;
                    copy_raw_payload(file, source, out)
                        .with_context(|| format!("copying {} from {archive:?}", entry.name))?;
                    offset += (record.len() as u64) + header.compressed_size as u64;
                }
                Some(DataSource::Bytes(_)) | Some(DataSource::File(_)) => {
                    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                    io::copy(&mut self.reader(idx)?, &mut encoder)
                        .with_context(|| format!("compressing {}", entry.name))?;
                    let compressed = encoder.finish()?;
                    header.compressed_size = zip32_size(compressed.len() as u64)?;
                    let record = header.local_record(&[]);
                    out.write_all(&record)?;
                    out.write_all(&compressed)?;
                    offset += (record.len() + compressed.len()) as u64;
                }
            }

            central.extend_from_slice(&header.central_record());
            count += 1;
        }

        let count =
            u16::try_from(count).map_err(|_| anyhow!("too many entries for a zip archive"))?;
        let cd_offset =
            u32::try_from(offset).map_err(|_| anyhow!("container exceeds the 4 GiB zip limit"))?;
        out.write_all(&central)?;

        let mut eocd = Vec::with_capacity(EOCD_LEN + self.comment.len());
        eocd.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&count.to_le_bytes());
        eocd.extend_from_slice(&count.to_le_bytes());
        eocd.extend_from_slice(&(central.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&cd_offset.to_le_bytes());
        eocd.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&self.comment);
        out.write_all(&eocd)?;
        Ok(())
    }
}

/// Archive holding `game` under `rom_dir`.
pub fn container_path(rom_dir: &Path, game: &str) -> PathBuf {
    rom_dir.join(format!("{game}.zip"))
}

fn zip32_size(len: u64) -> anyhow::Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|size| *size != u32::MAX)
        .ok_or_else(|| anyhow!("entry of {len} bytes needs zip64, which is not supported"))
}
