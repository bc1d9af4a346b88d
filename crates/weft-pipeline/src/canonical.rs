use crate::model::OutputKind;

/// Deterministic normalization of rendered content so semantically
/// identical input always yields byte-identical output. Idempotent:
/// `canonicalize(canonicalize(x)) == canonicalize(x)`. No locale-,
/// timezone-, or filesystem-order-dependent formatting.
pub fn canonicalize(kind: OutputKind, bytes: &[u8]) -> Result<Vec<u8>, String> {
    match kind {
        OutputKind::Structured => canonicalize_structured(bytes),
        OutputKind::Text => Ok(canonicalize_text(bytes)),
        OutputKind::Opaque => Ok(bytes.to_vec()),
    }
}

/// Structured content is reparsed and re-serialized: serde_json maps are
/// BTreeMap-backed, so keys come out sorted regardless of input order.
fn canonicalize_structured(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|error| format!("structured output is not valid JSON: {error}"))?;
    let mut out = serde_json::to_vec_pretty(&value)
        .map_err(|error| format!("failed re-serializing structured output: {error}"))?;
    out.push(b'\n');
    Ok(out)
}

/// Text normalization: CRLF -> LF, no trailing whitespace per line, exactly
/// one trailing newline.
fn canonicalize_text(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len());
    for line in text.replace("\r\n", "\n").split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    out.into_bytes()
}
