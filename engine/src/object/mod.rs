//! Raw git object parsing
//!
//! Splits the raw form of a commit or tag object (as printed by
//! `git cat-file`) into the exact payload that was signed and the detached
//! signature embedded in it. Objects are handled as bytes: messages need not
//! be UTF-8 (see the `encoding` commit header).

use bstr::ByteSlice;

use crate::error::{Result, TrustError};
use crate::models::{ObjectKind, SignedObject};

const SIGNATURE_HEADER: &[u8] = b"gpgsig ";
const PGP_SIGNATURE_BEGIN: &[u8] = b"-----BEGIN PGP SIGNATURE-----";
const PGP_SIGNATURE_END: &[u8] = b"-----END PGP SIGNATURE-----";
const ARMOR_BEGIN_PREFIX: &[u8] = b"-----BEGIN ";
const ARMOR_END_PREFIX: &[u8] = b"-----END ";

/// Position of the commit header scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Reading ordinary (signed) headers
    InHeader,
    /// Inside the continuation lines of a `gpgsig` header
    InSignature,
}

/// Classification of a single header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLine<'a> {
    /// Part of the signed payload
    Signed(&'a [u8]),
    /// Signature content, with the header name or the indent removed
    Signature(&'a [u8]),
}

impl ScanState {
    /// Feed one header line to the scanner
    pub fn step(self, line: &[u8]) -> (ScanState, HeaderLine<'_>) {
        if let Some(first) = line.strip_prefix(SIGNATURE_HEADER) {
            return (ScanState::InSignature, HeaderLine::Signature(first));
        }
        match self {
            ScanState::InSignature => match line.strip_prefix(b" ") {
                Some(continuation) => (ScanState::InSignature, HeaderLine::Signature(continuation)),
                None => (ScanState::InHeader, HeaderLine::Signed(line)),
            },
            ScanState::InHeader => (ScanState::InHeader, HeaderLine::Signed(line)),
        }
    }
}

/// Split object text at the first blank line into headers and message
fn split_message(text: &[u8], kind: ObjectKind) -> Result<(&[u8], &[u8])> {
    if text.is_empty() {
        return Err(TrustError::malformed(kind, "empty object"));
    }
    let pos = text
        .find("\n\n")
        .ok_or_else(|| TrustError::malformed(kind, "no blank line before message"))?;
    Ok((&text[..pos], &text[pos + 2..]))
}

/// An armored signature must reach its `-----END ` line; other values are
/// taken as they are.
fn signature_complete(lines: &[&[u8]]) -> bool {
    match (lines.first(), lines.last()) {
        (Some(first), Some(last)) if first.starts_with(ARMOR_BEGIN_PREFIX) => {
            lines.len() > 1 && last.starts_with(ARMOR_END_PREFIX)
        }
        _ => true,
    }
}

/// Extract the signed payload and signature from a raw commit object.
///
/// Returns `Ok(None)` when the commit carries no `gpgsig` header.
pub fn parse_commit(text: &[u8]) -> Result<Option<SignedObject>> {
    let (headers, message) = split_message(text, ObjectKind::Commit)?;

    if !headers.starts_with(b"tree ") {
        return Err(TrustError::malformed(
            ObjectKind::Commit,
            "first header is not a tree",
        ));
    }

    let mut state = ScanState::InHeader;
    let mut signed_headers: Vec<&[u8]> = Vec::new();
    let mut signature_lines: Vec<&[u8]> = Vec::new();

    for line in headers.split_str("\n") {
        let (next, classified) = state.step(line);
        match classified {
            HeaderLine::Signed(header) => signed_headers.push(header),
            HeaderLine::Signature(sig) => signature_lines.push(sig),
        }
        state = next;
    }

    if signature_lines.is_empty() {
        return Ok(None);
    }

    if !signature_complete(&signature_lines) {
        return Err(TrustError::malformed(
            ObjectKind::Commit,
            "truncated gpgsig header",
        ));
    }

    let mut payload = signed_headers.join(&b'\n');
    payload.extend_from_slice(b"\n\n");
    payload.extend_from_slice(message);

    let mut signature = signature_lines.join(&b'\n');
    signature.push(b'\n');

    Ok(Some(SignedObject { payload, signature }))
}

/// Extract the signed payload and signature from a raw annotated tag object.
///
/// Returns `Ok(None)` when the tag has no inline PGP signature.
pub fn parse_tag(text: &[u8]) -> Result<Option<SignedObject>> {
    let (headers, _) = split_message(text, ObjectKind::Tag)?;

    if !headers.split_str("\n").any(|line| line.starts_with(b"object ")) {
        return Err(TrustError::malformed(ObjectKind::Tag, "missing object header"));
    }

    let Some(pos) = text.find(PGP_SIGNATURE_BEGIN) else {
        return Ok(None);
    };

    // The marker must sit in the message, after the header block
    if pos <= headers.len() {
        return Err(TrustError::malformed(
            ObjectKind::Tag,
            "signature marker inside headers",
        ));
    }

    let (payload, signature) = text.split_at(pos);
    if !signature.contains_str(PGP_SIGNATURE_END) {
        return Err(TrustError::malformed(ObjectKind::Tag, "truncated signature block"));
    }

    Ok(Some(SignedObject {
        payload: payload.to_vec(),
        signature: signature.to_vec(),
    }))
}

/// Parse an object of the given kind
pub fn parse(kind: ObjectKind, text: &[u8]) -> Result<Option<SignedObject>> {
    match kind {
        ObjectKind::Commit => parse_commit(text),
        ObjectKind::Tag => parse_tag(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BStr;
    use pretty_assertions::assert_eq;

    const HEADERS: &str = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
        parent 1a410efbd13591db07496601ebc7a059dd55cfe9\n\
        author A U Thor <author@example.com> 1700000000 +0000\n\
        committer C O Mitter <committer@example.com> 1700000000 +0000";

    fn signed_commit(message: &str) -> String {
        format!(
            "{}\ngpgsig -----BEGIN PGP SIGNATURE-----\n \n iQEzBAABCAAdFiEE\n =abcd\n -----END PGP SIGNATURE-----\n\n{}",
            HEADERS, message
        )
    }

    fn text(bytes: &[u8]) -> &BStr {
        bytes.as_bstr()
    }

    const SIGNED_TAG: &str = "object 1a410efbd13591db07496601ebc7a059dd55cfe9\n\
        type commit\n\
        tag v1.0\n\
        tagger T Agger <tagger@example.com> 1700000000 +0000\n\
        \n\
        Release 1.0\n\
        -----BEGIN PGP SIGNATURE-----\n\
        \n\
        iQEzBAABCAAdFiEE\n\
        =abcd\n\
        -----END PGP SIGNATURE-----\n";

    #[test]
    fn test_parse_signed_commit() {
        let commit = signed_commit("Initial commit\n");
        let parsed = parse_commit(commit.as_bytes()).unwrap().unwrap();

        assert_eq!(
            text(&parsed.payload),
            text(format!("{}\n\nInitial commit\n", HEADERS).as_bytes())
        );
        assert_eq!(
            text(&parsed.signature),
            text(b"-----BEGIN PGP SIGNATURE-----\n\niQEzBAABCAAdFiEE\n=abcd\n-----END PGP SIGNATURE-----\n")
        );
    }

    #[test]
    fn test_parse_commit_is_deterministic() {
        let commit = signed_commit("Deterministic\n\nBody text\n");
        let first = parse_commit(commit.as_bytes()).unwrap().unwrap();
        let second = parse_commit(commit.as_bytes()).unwrap().unwrap();

        assert!(!first.payload.is_empty());
        assert!(!first.signature.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_latin1_message_kept_byte_exact() {
        let mut commit = format!(
            "{}\nencoding ISO-8859-1\ngpgsig -----BEGIN PGP SIGNATURE-----\n \n iQEz\n -----END PGP SIGNATURE-----\n\ncaf",
            HEADERS
        )
        .into_bytes();
        commit.extend_from_slice(b"\xe9\n");
        assert!(std::str::from_utf8(&commit).is_err());

        let parsed = parse_commit(&commit).unwrap().unwrap();
        let mut expected = format!("{}\nencoding ISO-8859-1\n\ncaf", HEADERS).into_bytes();
        expected.extend_from_slice(b"\xe9\n");
        assert_eq!(text(&parsed.payload), text(&expected));
    }

    #[test]
    fn test_empty_message_one_line_signature() {
        let commit = format!("{}\ngpgsig x509-detached-value\n\n", HEADERS);
        let parsed = parse_commit(commit.as_bytes()).unwrap().unwrap();

        assert_eq!(text(&parsed.payload), text(format!("{}\n\n", HEADERS).as_bytes()));
        assert_eq!(text(&parsed.signature), text(b"x509-detached-value\n"));
    }

    #[test]
    fn test_continuation_lines_deindented_once() {
        let continuation = ["  indented twice", " once", "-----END PGP SIGNATURE-----"];
        let mut commit = format!("{}\ngpgsig -----BEGIN PGP SIGNATURE-----\n", HEADERS);
        for line in &continuation {
            commit.push(' ');
            commit.push_str(line);
            commit.push('\n');
        }
        commit.push_str("\nmsg\n");

        let parsed = parse_commit(commit.as_bytes()).unwrap().unwrap();
        let signature = parsed.signature.to_str().unwrap();
        let lines: Vec<&str> = signature.lines().collect();

        assert_eq!(lines.len(), continuation.len() + 1);
        assert_eq!(lines[0], "-----BEGIN PGP SIGNATURE-----");
        assert_eq!(&lines[1..], &continuation[..]);
        assert!(signature.ends_with('\n'));
    }

    #[test]
    fn test_signature_in_middle_of_headers() {
        let commit = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
            gpgsig -----BEGIN PGP SIGNATURE-----\n \
            -----END PGP SIGNATURE-----\n\
            author A U Thor <author@example.com> 1700000000 +0000\n\
            \n\
            msg\n";
        let parsed = parse_commit(commit).unwrap().unwrap();

        assert_eq!(
            text(&parsed.payload),
            text(b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                   author A U Thor <author@example.com> 1700000000 +0000\n\nmsg\n")
        );
    }

    #[test]
    fn test_mergetag_continuations_stay_signed() {
        let commit = format!(
            "{}\nmergetag object 1a410efbd13591db07496601ebc7a059dd55cfe9\n type commit\n\nMerge\n",
            HEADERS
        );
        assert_eq!(parse_commit(commit.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_scan_state_transitions() {
        let (state, line) = ScanState::InHeader.step(b"gpgsig first");
        assert_eq!(state, ScanState::InSignature);
        assert_eq!(line, HeaderLine::Signature(b"first"));

        let (state, line) = state.step(b" second");
        assert_eq!(state, ScanState::InSignature);
        assert_eq!(line, HeaderLine::Signature(b"second"));

        let (state, line) = state.step(b"committer someone");
        assert_eq!(state, ScanState::InHeader);
        assert_eq!(line, HeaderLine::Signed(b"committer someone"));

        let (state, line) = state.step(b" not a signature");
        assert_eq!(state, ScanState::InHeader);
        assert_eq!(line, HeaderLine::Signed(b" not a signature"));
    }

    #[test]
    fn test_unsigned_commit_is_not_an_error() {
        let commit = format!("{}\n\nUnsigned\n", HEADERS);
        assert_eq!(parse_commit(commit.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_malformed_commits() {
        assert!(matches!(
            parse_commit(b""),
            Err(TrustError::MalformedObject { kind: ObjectKind::Commit, .. })
        ));
        assert!(matches!(
            parse_commit(HEADERS.as_bytes()),
            Err(TrustError::MalformedObject { .. })
        ));
        assert!(matches!(
            parse_commit(b"author someone\n\nmsg\n"),
            Err(TrustError::MalformedObject { .. })
        ));

        let truncated = format!("{}\ngpgsig -----BEGIN PGP SIGNATURE-----\n iQEz\n\nmsg\n", HEADERS);
        assert!(matches!(
            parse_commit(truncated.as_bytes()),
            Err(TrustError::MalformedObject { .. })
        ));

        let only_armor_header = format!("{}\ngpgsig -----BEGIN PGP SIGNATURE-----\n\nmsg\n", HEADERS);
        assert!(matches!(
            parse_commit(only_armor_header.as_bytes()),
            Err(TrustError::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_parse_signed_tag() {
        let parsed = parse_tag(SIGNED_TAG.as_bytes()).unwrap().unwrap();
        let marker = SIGNED_TAG.find("-----BEGIN PGP SIGNATURE-----").unwrap();

        assert_eq!(text(&parsed.payload), text(SIGNED_TAG[..marker].as_bytes()));
        assert!(parsed.payload.ends_with(b"Release 1.0\n"));
        assert_eq!(text(&parsed.signature), text(SIGNED_TAG[marker..].as_bytes()));
        assert_eq!([parsed.payload, parsed.signature].concat(), SIGNED_TAG.as_bytes());
    }

    #[test]
    fn test_unsigned_tag() {
        let tag = b"object 1a410efbd13591db07496601ebc7a059dd55cfe9\ntype commit\ntag v1.0\n\nRelease\n";
        assert_eq!(parse_tag(tag).unwrap(), None);
    }

    #[test]
    fn test_malformed_tags() {
        assert!(matches!(
            parse_tag(b"object abc\ntype commit"),
            Err(TrustError::MalformedObject { kind: ObjectKind::Tag, .. })
        ));
        assert!(matches!(
            parse_tag(b"type commit\ntag v1\n\nmsg\n"),
            Err(TrustError::MalformedObject { .. })
        ));

        let truncated = SIGNED_TAG.replace("-----END PGP SIGNATURE-----", "");
        assert!(matches!(
            parse_tag(truncated.as_bytes()),
            Err(TrustError::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_parse_dispatches_on_kind() {
        assert!(parse(ObjectKind::Tag, SIGNED_TAG.as_bytes()).unwrap().is_some());
        assert!(parse(ObjectKind::Commit, signed_commit("m\n").as_bytes()).unwrap().is_some());
    }
}
