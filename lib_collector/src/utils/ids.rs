use rand::{distr::Alphanumeric, Rng};

/// Length of the identifiers handed out to stations and storage targets.
pub const ID_LENGTH: usize = 6;

/// Returns a random alphanumeric string of `len` characters.
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Draws identifiers until `taken` rejects none of them.
pub fn unique_id<F>(len: usize, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    loop {
        let candidate = random_id(len);
        if !taken(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_id_has_requested_shape() {
        let id = random_id(ID_LENGTH);
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn unique_id_skips_taken_values() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let id = unique_id(2, |candidate| seen.contains(candidate));
            assert!(seen.insert(id));
        }
    }
}
