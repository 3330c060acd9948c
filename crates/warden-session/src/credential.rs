use sha2::{Digest, Sha256};

/// Short, non-reversible tag for a credential, safe to put in logs.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = fingerprint("access-token");
        assert_eq!(a.len(), 12);
        assert_eq!(a, fingerprint("access-token"));
        assert_ne!(a, fingerprint("access-token-2"));
        assert!(!a.contains("access"));
    }
}
