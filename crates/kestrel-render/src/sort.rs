//! Stable least-significant-digit radix sort on 64-bit keys.

/// Sortable entry: a key plus the command it orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortEntry {
    pub key: u64,
    pub command: u32,
}

/// Sort `entries` by key, keeping the submission order of equal keys.
///
/// `scratch` is resized to `entries.len()` and reused across calls. Byte
/// positions where every key agrees are skipped.
pub fn radix_sort(entries: &mut Vec<SortEntry>, scratch: &mut Vec<SortEntry>) {
    if entries.len() < 2 {
        return;
    }
    scratch.clear();
    scratch.resize(entries.len(), SortEntry { key: 0, command: 0 });

    for pass in 0..8 {
        let shift = pass * 8;
        let mut counts = [0usize; 256];
        for entry in entries.iter() {
            counts[((entry.key >> shift) & 0xFF) as usize] += 1;
        }
        if counts.iter().any(|&count| count == entries.len()) {
            continue;
        }

        let mut offsets = [0usize; 256];
        let mut total = 0;
        for (offset, count) in offsets.iter_mut().zip(counts) {
            *offset = total;
            total += count;
        }
        for entry in entries.iter() {
            let digit = ((entry.key >> shift) & 0xFF) as usize;
            scratch[offsets[digit]] = *entry;
            offsets[digit] += 1;
        }
        std::mem::swap(entries, scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(keys: &[u64]) -> Vec<SortEntry> {
        keys.iter()
            .enumerate()
            .map(|(i, &key)| SortEntry {
                key,
                command: i as u32,
            })
            .collect()
    }

    #[test]
    fn sorts_by_key() {
        let keys = [
            0xFFFF_0000_0000_0000,
            3,
            0x100,
            0,
            0x0000_0001_0000_0000,
            42,
        ];
        let mut list = entries(&keys);
        radix_sort(&mut list, &mut Vec::new());

        let mut expected = keys.to_vec();
        expected.sort_unstable();
        assert_eq!(list.iter().map(|e| e.key).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn equal_keys_keep_submission_order() {
        let mut list = entries(&[7, 1, 7, 1, 7]);
        radix_sort(&mut list, &mut Vec::new());
        let order: Vec<u32> = list.iter().map(|e| e.command).collect();
        assert_eq!(order, vec![1, 3, 0, 2, 4]);
    }

    #[test]
    fn matches_std_stable_sort() {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let keys: Vec<u64> = (0..500)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                // Few distinct values so ties are common.
                state & 0xF0F0_0000_0000_000F
            })
            .collect();

        let mut list = entries(&keys);
        let mut expected = list.clone();
        expected.sort_by_key(|e| e.key);
        radix_sort(&mut list, &mut Vec::new());
        assert_eq!(list, expected);
    }

    #[test]
    fn scratch_is_reused() {
        let mut scratch = Vec::with_capacity(64);
        let mut list = entries(&[3, 2, 1]);
        radix_sort(&mut list, &mut scratch);
        assert_eq!(list[0].key, 1);
        assert!(scratch.capacity() >= 3);
    }
}
