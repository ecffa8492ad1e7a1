//! Binary encoding of a [`CacheEntry`] for one cache file.
//!
//! Layout (all integers big-endian):
//! ```text
//! magic "FSMC" | version u8 | record count u32 | record*
//! record = key str | url str | status u16
//!        | header count u32 | (name str, value str)*
//!        | request_time i64 | response_time i64 | expires_at i64   (unix millis)
//!        | vary count u32 | (name str, value str)*
//!        | body len u32 | body bytes
//! str    = len u32 | utf-8 bytes
//! ```
//! Every field is length-prefixed, so a truncated or partially written file
//! fails to decode instead of yielding a bogus record.
use crate::{CacheEntry, CacheError, CacheKey, CacheRecord, VaryKeys};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

const MAGIC: &[u8; 4] = b"FSMC";
const VERSION: u8 = 1;

pub fn encode_entry(entry: &CacheEntry) -> Result<Bytes, CacheError> {
    let mut buf = BytesMut::with_capacity(entry.byte_size() as usize + 16);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    put_len(&mut buf, entry.records.len())?;
    for record in &entry.records {
        encode_record(&mut buf, record)?;
    }
    Ok(buf.freeze())
}

pub fn decode_entry(mut data: &[u8]) -> Result<CacheEntry, CacheError> {
    let buf = &mut data;
    let magic = take(buf, MAGIC.len())?;
    if magic != MAGIC {
        return Err(CacheError::Corrupt("bad magic".into()));
    }
    let version = get_u8(buf)?;
    if version != VERSION {
        return Err(CacheError::Corrupt(format!("unknown version {version}")));
    }

    let count = get_u32(buf)?;
    let mut records = Vec::new();
    for _ in 0..count {
        records.push(decode_record(buf)?);
    }
    if buf.has_remaining() {
        return Err(CacheError::Corrupt(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(CacheEntry::new(records))
}

fn encode_record(buf: &mut BytesMut, record: &CacheRecord) -> Result<(), CacheError> {
    put_str(buf, record.key.as_str())?;
    put_str(buf, &record.url)?;
    buf.put_u16(record.status_code);
    put_pairs(
        buf,
        record.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        record.headers.len(),
    )?;
    buf.put_i64(record.request_time.timestamp_millis());
    buf.put_i64(record.response_time.timestamp_millis());
    buf.put_i64(record.expires_at.timestamp_millis());
    put_pairs(
        buf,
        record.vary_keys.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        record.vary_keys.len(),
    )?;
    put_len(buf, record.body.len())?;
    buf.put_slice(&record.body);
    Ok(())
}

fn decode_record(buf: &mut &[u8]) -> Result<CacheRecord, CacheError> {
    let key = get_str(buf)?;
    let key = CacheKey::from_hex(&key)
        .ok_or_else(|| CacheError::Corrupt(format!("invalid key {key}")))?;
    let url = get_str(buf)?;
    let status_code = get_u16(buf)?;
    let headers = get_pairs(buf)?;
    let request_time = get_time(buf)?;
    let response_time = get_time(buf)?;
    let expires_at = get_time(buf)?;
    let vary_keys: VaryKeys = get_pairs(buf)?.into_iter().collect();
    let body_len = get_u32(buf)? as usize;
    let body = Bytes::copy_from_slice(take(buf, body_len)?);

    Ok(CacheRecord {
        key,
        url,
        status_code,
        headers,
        body,
        request_time,
        response_time,
        expires_at,
        vary_keys,
    })
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CacheError> {
    let len = u32::try_from(len).map_err(|_| CacheError::TooLarge(format!("length {len}")))?;
    buf.put_u32(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<(), CacheError> {
    put_len(buf, value.len())?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_pairs<'a>(
    buf: &mut BytesMut,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
    count: usize,
) -> Result<(), CacheError> {
    put_len(buf, count)?;
    for (name, value) in pairs {
        put_str(buf, name)?;
        put_str(buf, value)?;
    }
    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CacheError> {
    if buf.len() < len {
        return Err(CacheError::Corrupt(format!(
            "needed {len} bytes, {} left",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, CacheError> {
    Ok(take(buf, 1)?.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, CacheError> {
    Ok(take(buf, 2)?.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, CacheError> {
    Ok(take(buf, 4)?.get_u32())
}

fn get_time(buf: &mut &[u8]) -> Result<DateTime<Utc>, CacheError> {
    let millis = take(buf, 8)?.get_i64();
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| CacheError::Corrupt(format!("timestamp {millis} out of range")))
}

fn get_str(buf: &mut &[u8]) -> Result<String, CacheError> {
    let len = get_u32(buf)? as usize;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn get_pairs(buf: &mut &[u8]) -> Result<Vec<(String, String)>, CacheError> {
    let count = get_u32(buf)?;
    let mut pairs = Vec::new();
    for _ in 0..count {
        let name = get_str(buf)?;
        let value = get_str(buf)?;
        pairs.push((name, value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::record;

    fn sample_entry() -> CacheEntry {
        let mut entry = CacheEntry::default();
        let mut first = record(
            "http://h/flags/",
            r#"[{"enabled":true}]"#,
            &[("accept", "application/json")],
        );
        first.headers.push(("set-cookie".into(), "a=1".into()));
        first.headers.push(("set-cookie".into(), "b=2".into()));
        entry.upsert(first);
        entry.upsert(record("http://h/flags/", "", &[]));
        entry
    }

    #[test]
    fn test_decode_preserves_records_and_header_order() {
        let entry = sample_entry();
        let encoded = encode_entry(&entry).unwrap();
        let decoded = decode_entry(&encoded).unwrap();

        assert_eq!(decoded.records.len(), 2);
        let first = &decoded.records[0];
        assert_eq!(first.headers, entry.records[0].headers);
        assert_eq!(first.body, entry.records[0].body);
        assert_eq!(first.vary_keys, entry.records[0].vary_keys);
        // millisecond precision on disk
        assert_eq!(
            first.expires_at.timestamp_millis(),
            entry.records[0].expires_at.timestamp_millis()
        );
        assert!(decoded.records[1].body.is_empty());
    }

    #[test]
    fn test_every_truncation_is_detected() {
        let encoded = encode_entry(&sample_entry()).unwrap();
        for len in 0..encoded.len() {
            let result = decode_entry(&encoded[..len]);
            assert!(
                matches!(result, Err(CacheError::Corrupt(_))),
                "truncation at {len} decoded"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut encoded = encode_entry(&sample_entry()).unwrap().to_vec();
        encoded.push(0);
        assert!(matches!(decode_entry(&encoded), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_bad_magic_and_version() {
        assert!(matches!(
            decode_entry(b"NOPE\x01\x00\x00\x00\x00"),
            Err(CacheError::Corrupt(_))
        ));
        assert!(matches!(
            decode_entry(b"FSMC\x09\x00\x00\x00\x00"),
            Err(CacheError::Corrupt(_))
        ));
        assert!(decode_entry(b"FSMC\x01\x00\x00\x00\x00").unwrap().is_empty());
    }
}
