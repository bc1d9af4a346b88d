use crate::model::Statement;
use weft_store::ContentHash;

/// Digest of raw byte content. Stable across machines and time; nothing
/// but the bytes themselves is folded in.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    blake3::hash(bytes).to_hex().to_string()
}

/// Order-independent digest of a statement set: two graphs with identical
/// statements in different insertion order hash identically. Each field is
/// length-prefixed before folding so field boundaries cannot collide
/// ("ab"+"c" never hashes like "a"+"bc").
pub fn hash_statements(statements: &[Statement]) -> ContentHash {
    let mut sorted: Vec<&Statement> = statements.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for statement in sorted {
        fold_part(&mut hasher, &statement.subject);
        fold_part(&mut hasher, &statement.predicate);
        fold_part(&mut hasher, &statement.value);
    }
    hasher.finalize().to_hex().to_string()
}

/// Order-sensitive composite of several hashes (e.g. source ⊕ shapes for a
/// normalization cache key).
pub fn combine_hashes(parts: &[&str]) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        fold_part(&mut hasher, part);
    }
    hasher.finalize().to_hex().to_string()
}

fn fold_part(hasher: &mut blake3::Hasher, part: &str) {
    hasher.update(part.len().to_le_bytes().as_slice());
    hasher.update(part.as_bytes());
}
