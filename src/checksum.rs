use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use crc32fast::Hasher as Crc32;
use md5::{Digest as Md5Digest, Md5};
use sha1_smol::Sha1;
use sha2::Sha256;

use crate::config::Config;
use crate::types::{Checksum, ChecksumSet};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of comparing two checksum sets over a set of hash types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMatch {
    /// Every type known on both sides agrees, and there was at least one.
    Match,
    Mismatch,
    /// No hash type is known on both sides.
    NoCommon,
}

impl HashMatch {
    /// Weak acceptance: sets with nothing in common are not treated as a mismatch.
    pub fn is_acceptable(self) -> bool {
        self != HashMatch::Mismatch
    }
}

/// Symmetric comparison restricted to `types`.
pub fn compare_checksums(a: &ChecksumSet, b: &ChecksumSet, types: &[Checksum]) -> HashMatch {
    let mut common = false;
    for kind in types {
        if let (Some(x), Some(y)) = (a.get(*kind), b.get(*kind)) {
            if !x.eq_ignore_ascii_case(y) {
                return HashMatch::Mismatch;
            }
            common = true;
        }
    }
    if common {
        HashMatch::Match
    } else {
        HashMatch::NoCommon
    }
}

pub fn sizes_agree(a: Option<u64>, b: Option<u64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Size check followed by a hash comparison; an unknown size never disqualifies.
pub fn compare_files(
    size_a: Option<u64>,
    sums_a: &ChecksumSet,
    size_b: Option<u64>,
    sums_b: &ChecksumSet,
    types: &[Checksum],
) -> HashMatch {
    if !sizes_agree(size_a, size_b) {
        return HashMatch::Mismatch;
    }
    compare_checksums(sums_a, sums_b, types)
}

pub fn checksum_range(min: Checksum, max: Option<Checksum>) -> Vec<Checksum> {
    let min_rank = min.rank();
    let max_rank = max.map(|c| c.rank()).unwrap_or(min_rank);

    let mut checksums = Vec::new();
    for value in [
        Checksum::Crc32,
        Checksum::Md5,
        Checksum::Sha1,
        Checksum::Sha256,
    ] {
        if value.rank() >= min_rank && value.rank() <= max_rank {
            checksums.push(value);
        }
    }

    checksums
}

/// Hashes `reader` with each of `targets`, returning the digests and the byte count.
pub fn hash_stream<R: Read>(
    mut reader: R,
    targets: &[Checksum],
) -> anyhow::Result<(ChecksumSet, u64)> {
    let wants = |kind: Checksum| targets.contains(&kind);
    let mut crc32h = wants(Checksum::Crc32).then(Crc32::new);
    let mut md5h = wants(Checksum::Md5).then(Md5::new);
    let mut sha1h = wants(Checksum::Sha1).then(Sha1::new);
    let mut sha256h = wants(Checksum::Sha256).then(Sha256::new);

    let mut processed: u64 = 0;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        processed = processed.saturating_add(n as u64);
        let slice = &buf[..n];
        if let Some(h) = crc32h.as_mut() {
            h.update(slice);
        }
        if let Some(h) = md5h.as_mut() {
            h.update(slice);
        }
        if let Some(h) = sha1h.as_mut() {
            h.update(slice);
        }
        if let Some(h) = sha256h.as_mut() {
            h.update(slice);
        }
    }

    let checksums = ChecksumSet {
        crc32: crc32h.map(|h| format!("{:08x}", h.finalize())),
        md5: md5h.map(|h| format!("{:032x}", h.finalize())),
        sha1: sha1h.map(|h| h.digest().to_string()),
        sha256: sha256h.map(|h| format!("{:064x}", h.finalize())),
    };
    Ok((checksums, processed))
}

/// Configured hash types plus CRC32, which ZIP directories always carry.
pub fn hash_targets(config: &Config) -> Vec<Checksum> {
    let mut targets = config.hash_types();
    if !targets.contains(&Checksum::Crc32) {
        targets.insert(0, Checksum::Crc32);
    }
    targets
}

pub fn compute_checksums_stream<R: Read>(
    reader: R,
    config: &Config,
) -> anyhow::Result<(ChecksumSet, u64)> {
    hash_stream(reader, &hash_targets(config))
}

pub fn compute_checksums(path: &Path, config: &Config) -> anyhow::Result<(ChecksumSet, u64)> {
    let file = File::open(path).with_context(|| format!("opening file for checksum: {path:?}"))?;
    compute_checksums_stream(file, config)
        .with_context(|| format!("reading file for checksum: {path:?}"))
}

pub fn compute_checksums_from_bytes(buf: &[u8], config: &Config) -> anyhow::Result<ChecksumSet> {
    let (checksums, _) = compute_checksums_stream(buf, config)?;
    Ok(checksums)
}
