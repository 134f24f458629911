use crate::block::Block;

/// Number of leading `'0'` characters in a hex digest.
pub fn leading_zero_chars(hash: &str) -> u32 {
    hash.bytes().take_while(|b| *b == b'0').count() as u32
}

/// A hash is admissible when it starts with at least `difficulty` zeros.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    leading_zero_chars(hash) >= difficulty
}

/// Mine the block by incrementing the nonce from 0 until its digest has at
/// least `difficulty` leading zeros. Returns the admissible digest; the
/// winning nonce is left on the block.
pub fn proof_of_work(block: &mut Block, difficulty: u32) -> String {
    let preimage = block.preimage();
    let mut nonce = 0u64;
    loop {
        let digest = preimage.digest(nonce);
        if meets_difficulty(&digest, difficulty) {
            block.set_nonce(nonce);
            return digest;
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Same search as [`proof_of_work`], but `cancelled` is polled before every
/// attempt. Returns `None` once it reports true; the block's nonce is then
/// whatever was last tried.
pub fn proof_of_work_cancellable<F>(block: &mut Block, difficulty: u32, cancelled: F) -> Option<String>
where
    F: Fn() -> bool,
{
    let preimage = block.preimage();
    let mut nonce = 0u64;
    loop {
        if cancelled() {
            block.set_nonce(nonce);
            return None;
        }
        let digest = preimage.digest(nonce);
        if meets_difficulty(&digest, difficulty) {
            block.set_nonce(nonce);
            return Some(digest);
        }
        nonce = nonce.wrapping_add(1);
    }
}
