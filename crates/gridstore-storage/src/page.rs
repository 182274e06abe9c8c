//! Data page layout
//!
//! A data page stores the entries of one partition back to back:
//! ```text
//! +-------+------+---------------------------------------------+---------+
//! | Count | Used | Entry 0 | Entry 1 | ...                      | zeroes  |
//! | 2B    | 2B   | klen 2B | vlen 2B | key | value | ...        |         |
//! +-------+------+---------------------------------------------+---------+
//! ```
//! An all-zero page is a valid empty page, so freshly allocated pages need
//! no initialization record.

use gridstore_common::codec::{read_u16, write_u16};
use gridstore_common::{Error, Result};

/// Page header size (entry count + used bytes)
pub const PAGE_HEADER_SIZE: usize = 4;

/// Per-entry header size (key length + value length)
pub const ENTRY_HEADER_SIZE: usize = 4;

/// Bytes an entry occupies inside a page
#[must_use]
pub const fn entry_size(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_SIZE + key_len + value_len
}

/// Largest entry (header included) a page of `page_size` can hold
#[must_use]
pub const fn max_entry_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Decoded contents of a data page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPage {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    used: usize,
}

impl DataPage {
    /// Decode a page image
    pub fn decode(page: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| Error::CorruptPageStore(format!("data page {what}"));

        let count = read_u16(page, 0).ok_or_else(|| corrupt("header truncated"))? as usize;
        let used = read_u16(page, 2).ok_or_else(|| corrupt("header truncated"))? as usize;
        if PAGE_HEADER_SIZE + used > page.len() {
            return Err(corrupt("used bytes exceed page size"));
        }

        let mut entries = Vec::with_capacity(count);
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..count {
            let klen = read_u16(page, offset).ok_or_else(|| corrupt("entry truncated"))? as usize;
            let vlen =
                read_u16(page, offset + 2).ok_or_else(|| corrupt("entry truncated"))? as usize;
            let start = offset + ENTRY_HEADER_SIZE;
            let end = start + klen + vlen;
            if end > PAGE_HEADER_SIZE + used {
                return Err(corrupt("entry overruns used region"));
            }
            entries.push((
                page[start..start + klen].to_vec(),
                page[start + klen..end].to_vec(),
            ));
            offset = end;
        }

        if offset != PAGE_HEADER_SIZE + used {
            return Err(corrupt("used bytes do not match entries"));
        }

        Ok(Self { entries, used })
    }

    /// Encode into a full page image of `page_size` bytes
    #[must_use]
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        write_u16(&mut page, 0, self.entries.len() as u16);
        write_u16(&mut page, 2, self.used as u16);

        let mut offset = PAGE_HEADER_SIZE;
        for (key, value) in &self.entries {
            write_u16(&mut page, offset, key.len() as u16);
            write_u16(&mut page, offset + 2, value.len() as u16);
            offset += ENTRY_HEADER_SIZE;
            page[offset..offset + key.len()].copy_from_slice(key);
            offset += key.len();
            page[offset..offset + value.len()].copy_from_slice(value);
            offset += value.len();
        }
        page
    }

    /// Value stored for `key`
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Bytes used by entries
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Free bytes left in a page of `page_size`
    #[must_use]
    pub const fn free(&self, page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - self.used
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the page holds no entry
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in page order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Consume into owned entries
    #[must_use]
    pub fn into_entries(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
    }

    /// Whether `key` with a value of `value_len` bytes fits in this page
    #[must_use]
    pub fn fits(&self, key: &[u8], value_len: usize, page_size: usize) -> bool {
        let old_size = self
            .entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map_or(0, |(_, v)| entry_size(key.len(), v.len()));
        self.used - old_size + entry_size(key.len(), value_len) <= max_entry_size(page_size)
    }

    /// Insert or replace `key`; returns false (page unchanged) if it does not fit
    pub fn upsert(&mut self, key: &[u8], value: Vec<u8>, page_size: usize) -> bool {
        if !self.fits(key, value.len(), page_size) {
            return false;
        }
        let existing = self.entries.iter().position(|(k, _)| k.as_slice() == key);
        let old_size = existing.map_or(0, |i| entry_size(key.len(), self.entries[i].1.len()));
        let new_size = entry_size(key.len(), value.len());

        match existing {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((key.to_vec(), value)),
        }
        self.used = self.used - old_size + new_size;
        true
    }

    /// Remove `key`; returns whether it was present
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.iter().position(|(k, _)| k.as_slice() == key) {
            Some(i) => {
                let (k, v) = self.entries.remove(i);
                self.used -= entry_size(k.len(), v.len());
                true
            }
            None => false,
        }
    }
}

/// Smallest byte range over which `old` and `new` differ
///
/// Returns `(offset, new bytes)` or `None` when the images are equal.
#[must_use]
pub fn diff<'a>(old: &[u8], new: &'a [u8]) -> Option<(usize, &'a [u8])> {
    let len = old.len().min(new.len());
    let first = (0..len).find(|&i| old[i] != new[i]);
    let first = match first {
        Some(i) => i,
        None if old.len() == new.len() => return None,
        None => len,
    };
    let last = (first..new.len())
        .rev()
        .find(|&i| i >= old.len() || old[i] != new[i])
        .unwrap_or(first);
    Some((first, &new[first..=last]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 512;

    #[test]
    fn test_zero_page_is_empty() {
        let page = DataPage::decode(&[0u8; PAGE]).unwrap();
        assert!(page.is_empty());
        assert_eq!(page.free(PAGE), PAGE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_upsert_get_remove() {
        let mut page = DataPage::default();
        assert!(page.upsert(b"a", b"1".to_vec(), PAGE));
        assert!(page.upsert(b"b", b"22".to_vec(), PAGE));
        assert!(page.upsert(b"a", b"333".to_vec(), PAGE));

        let decoded = DataPage::decode(&page.encode(PAGE)).unwrap();
        assert_eq!(decoded.get(b"a"), Some(&b"333"[..]));
        assert_eq!(decoded.get(b"b"), Some(&b"22"[..]));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.used(), entry_size(1, 3) + entry_size(1, 2));

        let mut page = decoded;
        assert!(page.remove(b"a"));
        assert!(!page.remove(b"a"));
        assert_eq!(page.used(), entry_size(1, 2));
    }

    #[test]
    fn test_upsert_rejects_overflow() {
        let mut page = DataPage::default();
        let big = vec![7u8; max_entry_size(PAGE) - ENTRY_HEADER_SIZE - 1];
        assert!(page.upsert(b"k", big, PAGE));
        assert_eq!(page.free(PAGE), 0);
        assert!(!page.fits(b"x", 0, PAGE));
        assert!(!page.upsert(b"x", vec![], PAGE));
        // Replacing with a smaller value still fits
        assert!(page.upsert(b"k", vec![1], PAGE));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut page = vec![0u8; PAGE];
        write_u16(&mut page, 0, 3);
        write_u16(&mut page, 2, 2);
        assert!(matches!(
            DataPage::decode(&page),
            Err(Error::CorruptPageStore(_))
        ));
    }

    #[test]
    fn test_diff_ranges() {
        let old = vec![0u8; 16];
        assert_eq!(diff(&old, &old), None);

        let mut new = old.clone();
        new[3] = 1;
        new[9] = 2;
        let (offset, bytes) = diff(&old, &new).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[6], 2);
    }
}
