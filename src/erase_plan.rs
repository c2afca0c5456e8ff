use crate::EraseKind;

/// Erase plan of (erase kind, base address) to erase a range of memory.
#[derive(Clone, Debug)]
pub(crate) struct ErasePlan(pub Vec<(EraseKind, u32)>);

impl ErasePlan {
    pub fn new(kinds: &[EraseKind], start: usize, length: usize) -> Self {
        log::trace!("Creating erase plan, start={} length={}", start, length);
        let mut plan = Vec::new();

        // Sort erase kinds by smallest area of effect first.
        let mut kinds = kinds.to_vec();
        kinds.sort_by_key(|k| k.size());

        // We compute the number of useful bytes erased for each operation,
        // then from those with the same maximum number of useful bytes erased,
        // we select the smallest operation, and repeat until all bytes are erased.
        let end = start + length;
        let mut pos = start;
        while pos < end {
            log::trace!("Evaluating candidates, pos={} end={}", pos, end);
            // Current candidate, (bytes, size, kind, base).
            let mut candidate: Option<(usize, usize, EraseKind, usize)> = None;
            for kind in kinds.iter() {
                let erase_size = kind.size();
                let erase_base = pos - (pos % erase_size);
                let erase_end = erase_base + erase_size;
                let bytes = usize::min(erase_end, end) - pos;
                log::trace!(
                    "  Candidate {:?}: base={} end={} bytes={}",
                    kind,
                    erase_base,
                    erase_end,
                    bytes
                );
                let better = match candidate {
                    None => true,
                    Some((c_bytes, c_size, _, _)) =>
                        bytes > c_bytes || (bytes == c_bytes && erase_size < c_size),
                };
                if better {
                    candidate = Some((bytes, erase_size, *kind, erase_base));
                }
            }

            match candidate {
                Some((bytes, _, kind, base)) => {
                    log::trace!("Candidate selected: {:?} at {}", kind, base);
                    pos += bytes;
                    plan.push((kind, base as u32));
                },
                None => break,
            }
        }

        log::debug!("Erase plan: {:?}", plan);

        ErasePlan(plan)
    }

    pub fn total_size(&self) -> usize {
        self.0.iter().map(|(kind, _)| kind.size()).sum()
    }
}

#[test]
fn test_erase_plan() {
    use EraseKind::*;
    const K: usize = 1024;
    let kinds = &[Sector, Block32K, Block64K];
    // Use a single 4kB erase to erase an aligned 4kB block.
    assert_eq!(ErasePlan::new(kinds, 0, 4 * K).0, vec![(Sector, 0)]);
    // Use a single 64kB erase to erase an aligned 64kB block.
    assert_eq!(ErasePlan::new(kinds, 0, 64 * K).0, vec![(Block64K, 0)]);
    // Use three 64kB erases to erase an aligned 192kB block.
    assert_eq!(
        ErasePlan::new(kinds, 0, 192 * K).0,
        vec![(Block64K, 0), (Block64K, 0x1_0000), (Block64K, 0x2_0000)]
    );
    // Use 64kB followed by 32kB to erase an aligned 70kB block.
    assert_eq!(
        ErasePlan::new(kinds, 0, 70 * K).0,
        vec![(Block64K, 0), (Block32K, 0x1_0000)]
    );
    // Use 64kB followed by 4kB to erase an aligned 66kB block.
    assert_eq!(
        ErasePlan::new(kinds, 0, 66 * K).0,
        vec![(Block64K, 0), (Sector, 0x1_0000)]
    );
    // Use 4kB followed by 64kB to erase a misaligned 64kB block.
    assert_eq!(
        ErasePlan::new(kinds, 62 * K, 64 * K).0,
        vec![(Sector, 60 * K as u32), (Block64K, 0x1_0000)]
    );
    // Use a 4kB, 64kB, 4kB to erase a misaligned 68kB block.
    assert_eq!(
        ErasePlan::new(kinds, 62 * K, 68 * K).0,
        vec![(Sector, 60 * K as u32), (Block64K, 0x1_0000), (Sector, 0x2_0000)]
    );
    assert_eq!(ErasePlan::new(kinds, 62 * K, 68 * K).total_size(), 72 * K);
    // Nothing to erase.
    assert!(ErasePlan::new(kinds, 4 * K, 0).0.is_empty());
}
