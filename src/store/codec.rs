//! Byte-level encoding for the disk store.
//!
//! Log segments are framed batches of entries with CRC32 checksums, all
//! integers little-endian, 8-byte aligned. Snapshot metadata uses big-endian
//! 64-bit words. The configuration encoding is shared by both.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::error::StorageError;
use crate::membership::Configuration;
use crate::membership::ServerRole;

/// On-disk format version, shared by segments, snapshot metadata and the
/// term/vote metadata file.
pub(crate) const DISK_FORMAT: u64 = 1;

/// Entry type codes.
pub(crate) const ENTRY_COMMAND: u32 = 1;
pub(crate) const ENTRY_BARRIER: u32 = 2;
pub(crate) const ENTRY_CONFIGURATION: u32 = 3;

/// Upper bound on a single entry payload; larger lengths are implausible and
/// read as corruption.
pub(crate) const MAX_ENTRY_LEN: u64 = 64 * 1024 * 1024;

/// Upper bound on an encoded configuration.
pub(crate) const MAX_CONFIGURATION_LEN: u64 = 1024 * 1024;

/// An entry as stored in a segment: the payload is already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WireEntry {
    pub term: u64,
    pub etype: u32,
    pub payload: Vec<u8>,
}

/// Why a batch could not be decoded.
///
/// In an open segment a short read or checksum mismatch is a torn tail to be
/// repaired; in a closed segment either is corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchError {
    ShortRead,
    BadChecksum,
    ImplausibleLength,
}

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// The encoded size of a batch holding the given entries.
pub(crate) fn batch_size(entries: &[WireEntry]) -> usize {
    8 + 8 + 16 * entries.len() + entries.iter().map(|e| pad8(e.payload.len())).sum::<usize>()
}

/// Encode a batch: `(crc_header, crc_data, n_entries, (term, type, len)*,
/// payloads*)`, payloads padded to 8 bytes.
pub(crate) fn encode_batch(entries: &[WireEntry]) -> Vec<u8> {
    debug_assert!(!entries.is_empty());
    let size = batch_size(entries);
    let mut buf = vec![0u8; size];

    let header_start = 8;
    let header_len = 8 + 16 * entries.len();
    LittleEndian::write_u64(&mut buf[header_start..], entries.len() as u64);
    let mut off = header_start + 8;
    for entry in entries {
        LittleEndian::write_u64(&mut buf[off..], entry.term);
        LittleEndian::write_u32(&mut buf[off + 8..], entry.etype);
        LittleEndian::write_u32(&mut buf[off + 12..], entry.payload.len() as u32);
        off += 16;
    }

    let data_start = off;
    for entry in entries {
        buf[off..off + entry.payload.len()].copy_from_slice(&entry.payload);
        off += pad8(entry.payload.len());
    }
    debug_assert_eq!(off, size);

    let crc_header = crc32(&buf[header_start..header_start + header_len]);
    let crc_data = crc32(&buf[data_start..]);
    LittleEndian::write_u32(&mut buf[0..], crc_header);
    LittleEndian::write_u32(&mut buf[4..], crc_data);
    buf
}

/// Decode the batch at `*off`, advancing it past the batch.
///
/// Returns `Ok(None)` on a clean end of log: the buffer is exhausted, or the
/// next words are still zero (the unwritten remainder of a preallocated
/// segment).
pub(crate) fn decode_batch(buf: &[u8], off: &mut usize) -> Result<Option<Vec<WireEntry>>, BatchError> {
    let start = *off;
    if start == buf.len() {
        return Ok(None);
    }
    if start + 16 > buf.len() {
        return Err(BatchError::ShortRead);
    }

    let crc_header = LittleEndian::read_u32(&buf[start..]);
    let crc_data = LittleEndian::read_u32(&buf[start + 4..]);
    let n_entries = LittleEndian::read_u64(&buf[start + 8..]);
    if crc_header == 0 && crc_data == 0 && n_entries == 0 {
        return Ok(None);
    }
    if n_entries == 0 || n_entries > (buf.len() as u64) / 16 {
        return Err(BatchError::ImplausibleLength);
    }

    let header_start = start + 8;
    let header_len = 8 + 16 * n_entries as usize;
    if header_start + header_len > buf.len() {
        return Err(BatchError::ShortRead);
    }
    if crc32(&buf[header_start..header_start + header_len]) != crc_header {
        return Err(BatchError::BadChecksum);
    }

    let mut headers = Vec::with_capacity(n_entries as usize);
    let mut data_len = 0usize;
    let mut hoff = header_start + 8;
    for _ in 0..n_entries {
        let term = LittleEndian::read_u64(&buf[hoff..]);
        let etype = LittleEndian::read_u32(&buf[hoff + 8..]);
        let len = LittleEndian::read_u32(&buf[hoff + 12..]) as u64;
        if len > MAX_ENTRY_LEN {
            return Err(BatchError::ImplausibleLength);
        }
        headers.push((term, etype, len as usize));
        data_len += pad8(len as usize);
        hoff += 16;
    }

    let data_start = header_start + header_len;
    if data_start + data_len > buf.len() {
        return Err(BatchError::ShortRead);
    }
    if crc32(&buf[data_start..data_start + data_len]) != crc_data {
        return Err(BatchError::BadChecksum);
    }

    let mut entries = Vec::with_capacity(headers.len());
    let mut doff = data_start;
    for (term, etype, len) in headers {
        entries.push(WireEntry {
            term,
            etype,
            payload: buf[doff..doff + len].to_vec(),
        });
        doff += pad8(len);
    }

    *off = data_start + data_len;
    Ok(Some(entries))
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Encode a configuration: `n`, then per server `(id, role, addr_len, addr)`,
/// addresses padded to 8 bytes. Little-endian.
pub(crate) fn encode_configuration(configuration: &Configuration) -> Vec<u8> {
    let size = 8 + configuration
        .servers
        .iter()
        .map(|s| 16 + pad8(s.address.len()))
        .sum::<usize>();
    let mut buf = vec![0u8; size];
    LittleEndian::write_u64(&mut buf[0..], configuration.servers.len() as u64);
    let mut off = 8;
    for server in &configuration.servers {
        LittleEndian::write_u64(&mut buf[off..], server.id);
        LittleEndian::write_u32(&mut buf[off + 8..], server.role.code() as u32);
        LittleEndian::write_u32(&mut buf[off + 12..], server.address.len() as u32);
        off += 16;
        buf[off..off + server.address.len()].copy_from_slice(server.address.as_bytes());
        off += pad8(server.address.len());
    }
    buf
}

/// Decode a configuration previously encoded with [`encode_configuration`].
pub(crate) fn decode_configuration(buf: &[u8]) -> Result<Configuration, StorageError> {
    let corrupt = || StorageError::corrupt(anyhow::anyhow!("invalid configuration encoding"));
    if buf.len() < 8 {
        return Err(corrupt());
    }
    let n = LittleEndian::read_u64(&buf[0..]);
    let mut configuration = Configuration::new();
    let mut off = 8usize;
    for _ in 0..n {
        if off + 16 > buf.len() {
            return Err(corrupt());
        }
        let id = LittleEndian::read_u64(&buf[off..]);
        let role = LittleEndian::read_u32(&buf[off + 8..]);
        let addr_len = LittleEndian::read_u32(&buf[off + 12..]) as usize;
        off += 16;
        if off + addr_len > buf.len() {
            return Err(corrupt());
        }
        let address = std::str::from_utf8(&buf[off..off + addr_len]).map_err(|_| corrupt())?.to_string();
        off += pad8(addr_len);
        let role = ServerRole::from_code(role as u8).ok_or_else(corrupt)?;
        configuration.add(id, address, role).map_err(|_| corrupt())?;
    }
    Ok(configuration)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Encode snapshot metadata: big-endian words `(format, crc, configuration
/// index, configuration length)` followed by the configuration bytes. The
/// CRC covers words 2.. plus the configuration bytes.
pub(crate) fn encode_snapshot_meta(configuration: &Configuration, configuration_index: u64) -> Vec<u8> {
    let conf = encode_configuration(configuration);
    let mut buf = vec![0u8; 32 + conf.len()];
    BigEndian::write_u64(&mut buf[0..], DISK_FORMAT);
    BigEndian::write_u64(&mut buf[16..], configuration_index);
    BigEndian::write_u64(&mut buf[24..], conf.len() as u64);
    buf[32..].copy_from_slice(&conf);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[16..]);
    let crc = hasher.finalize();
    BigEndian::write_u64(&mut buf[8..], crc as u64);
    buf
}

/// Decode snapshot metadata, returning `(configuration_index, configuration)`.
pub(crate) fn decode_snapshot_meta(buf: &[u8]) -> Result<(u64, Configuration), StorageError> {
    if buf.len() < 32 {
        return Err(StorageError::corrupt(anyhow::anyhow!("snapshot metadata too short")));
    }
    let format = BigEndian::read_u64(&buf[0..]);
    if format != DISK_FORMAT {
        return Err(StorageError::malformed(anyhow::anyhow!(
            "unsupported snapshot format {format}"
        )));
    }
    let crc = BigEndian::read_u64(&buf[8..]);
    let configuration_index = BigEndian::read_u64(&buf[16..]);
    let conf_len = BigEndian::read_u64(&buf[24..]);
    if conf_len == 0 || conf_len > MAX_CONFIGURATION_LEN || 32 + conf_len > buf.len() as u64 {
        return Err(StorageError::corrupt(anyhow::anyhow!(
            "implausible configuration length {conf_len}"
        )));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[16..32 + conf_len as usize]);
    if hasher.finalize() as u64 != crc {
        return Err(StorageError::corrupt(anyhow::anyhow!("snapshot metadata checksum mismatch")));
    }

    let configuration = decode_configuration(&buf[32..32 + conf_len as usize])?;
    Ok((configuration_index, configuration))
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Encode the term/vote metadata record: little-endian `(format, term,
/// voted_for, crc32, 0)`.
pub(crate) fn encode_metadata(term: u64, voted_for: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    LittleEndian::write_u64(&mut buf[0..], DISK_FORMAT);
    LittleEndian::write_u64(&mut buf[8..], term);
    LittleEndian::write_u64(&mut buf[16..], voted_for);
    let crc = crc32(&buf[0..24]);
    LittleEndian::write_u32(&mut buf[24..], crc);
    buf
}

/// Decode a term/vote metadata record.
pub(crate) fn decode_metadata(buf: &[u8]) -> Result<(u64, u64), StorageError> {
    if buf.len() < 32 {
        return Err(StorageError::corrupt(anyhow::anyhow!("metadata file too short")));
    }
    let format = LittleEndian::read_u64(&buf[0..]);
    if format != DISK_FORMAT {
        return Err(StorageError::malformed(anyhow::anyhow!("unsupported metadata format {format}")));
    }
    let term = LittleEndian::read_u64(&buf[8..]);
    let voted_for = LittleEndian::read_u64(&buf[16..]);
    let crc = LittleEndian::read_u32(&buf[24..]);
    if crc32(&buf[0..24]) != crc {
        return Err(StorageError::corrupt(anyhow::anyhow!("metadata checksum mismatch")));
    }
    Ok((term, voted_for))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_entries() -> Vec<WireEntry> {
        vec![
            WireEntry {
                term: 3,
                etype: ENTRY_COMMAND,
                payload: b"set x = 1".to_vec(),
            },
            WireEntry {
                term: 3,
                etype: ENTRY_BARRIER,
                payload: Vec::new(),
            },
            WireEntry {
                term: 4,
                etype: ENTRY_COMMAND,
                payload: vec![0xAB; 17],
            },
        ]
    }

    #[test]
    fn test_batch_survives_zero_padded_tail() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        assert_eq!(buf.len(), batch_size(&entries));
        assert_eq!(buf.len() % 8, 0);

        // Simulate the unwritten remainder of a preallocated segment.
        buf.extend_from_slice(&[0u8; 256]);

        let mut off = 0;
        let decoded = decode_batch(&buf, &mut off).unwrap().unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(decode_batch(&buf, &mut off).unwrap(), None);
    }

    #[test]
    fn test_torn_tail_reads_as_short() {
        let entries = sample_entries();
        let buf = encode_batch(&entries);
        // A crash mid-write leaves a prefix of the batch.
        let torn = &buf[..buf.len() - 5];
        let mut off = 0;
        assert_eq!(decode_batch(torn, &mut off), Err(BatchError::ShortRead));
    }

    #[test]
    fn test_flipped_payload_byte_fails_data_checksum() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        let len = buf.len();
        buf[len - 3] ^= 0xFF;
        let mut off = 0;
        assert_eq!(decode_batch(&buf, &mut off), Err(BatchError::BadChecksum));
    }

    #[test]
    fn test_flipped_header_byte_fails_header_checksum() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        buf[9] ^= 0x01; // inside n_entries
        let mut off = 0;
        let err = decode_batch(&buf, &mut off).unwrap_err();
        assert!(matches!(err, BatchError::BadChecksum | BatchError::ImplausibleLength));
    }

    fn sample_configuration() -> Configuration {
        let mut c = Configuration::new();
        c.add(1, "127.0.0.1:7001", ServerRole::Voter).unwrap();
        c.add(2, "127.0.0.1:7002", ServerRole::Standby).unwrap();
        c.add(7, "node-seven.internal:9000", ServerRole::Spare).unwrap();
        c
    }

    #[test]
    fn test_configuration_round_trip() {
        let c = sample_configuration();
        let buf = encode_configuration(&c);
        assert_eq!(buf.len() % 8, 0);
        assert_eq!(decode_configuration(&buf).unwrap(), c);
    }

    #[test]
    fn test_configuration_truncated_is_corrupt() {
        let buf = encode_configuration(&sample_configuration());
        let err = decode_configuration(&buf[..buf.len() - 4]).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Corrupt);
    }

    #[test]
    fn test_snapshot_meta_round_trip_and_corruption() {
        let c = sample_configuration();
        let buf = encode_snapshot_meta(&c, 42);
        let (idx, decoded) = decode_snapshot_meta(&buf).unwrap();
        assert_eq!(idx, 42);
        assert_eq!(decoded, c);

        let mut bad = buf.clone();
        bad[40] ^= 0x10;
        let err = decode_snapshot_meta(&bad).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Corrupt);

        let mut wrong_format = buf;
        wrong_format[7] = 9;
        let err = decode_snapshot_meta(&wrong_format).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Malformed);
    }

    #[test]
    fn test_metadata_round_trip() {
        let buf = encode_metadata(7, 3);
        assert_eq!(decode_metadata(&buf).unwrap(), (7, 3));

        let mut bad = buf;
        bad[12] ^= 0x40;
        let err = decode_metadata(&bad).unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Corrupt);
    }
}
