use encoding_rs::{BIG5, Encoding, GBK, UTF_8};

/// Candidate decoders in trial order: platform-preferred first, then UTF-8,
/// then the CJK legacy encodings the tunnel client is known to emit.
pub fn candidate_encodings() -> Vec<&'static Encoding> {
    let mut candidates: Vec<&'static Encoding> = Vec::new();
    for encoding in [platform_preferred(), UTF_8, GBK, BIG5] {
        if !candidates.contains(&encoding) {
            candidates.push(encoding);
        }
    }
    candidates
}

fn platform_preferred() -> &'static Encoding {
    // The client ships as a Chinese-market Windows build, where the ANSI code
    // page is cp936.
    if cfg!(windows) { GBK } else { UTF_8 }
}

/// Decode one output chunk. The sticky encoding is tried first; when it fails
/// the candidates are retried from the top and the first success becomes the
/// new sticky choice. When nothing decodes cleanly the first candidate is
/// applied with substitution so no data is dropped.
pub fn decode_chunk(
    bytes: &[u8],
    sticky: Option<&'static Encoding>,
    candidates: &[&'static Encoding],
) -> (String, Option<&'static Encoding>) {
    if let Some(encoding) = sticky
        && let Some(text) = try_decode(bytes, encoding)
    {
        return (text, Some(encoding));
    }

    for &encoding in candidates {
        if let Some(text) = try_decode(bytes, encoding) {
            return (text, Some(encoding));
        }
    }

    let fallback = candidates.first().copied().unwrap_or(UTF_8);
    let (text, _, _) = fallback.decode(bytes);
    (text.into_owned(), None)
}

fn try_decode(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial_order() -> [&'static Encoding; 3] {
        [UTF_8, GBK, BIG5]
    }

    // "中文" encoded as GBK; not valid UTF-8.
    const GBK_BYTES: &[u8] = &[0xd6, 0xd0, 0xce, 0xc4];

    #[test]
    fn utf8_input_adopts_utf8() {
        let (text, adopted) = decode_chunk("hello 世界".as_bytes(), None, &trial_order());
        assert_eq!(text, "hello 世界");
        assert_eq!(adopted, Some(UTF_8));
    }

    #[test]
    fn gbk_only_input_falls_through_to_gbk_and_sticks() {
        let (text, adopted) = decode_chunk(GBK_BYTES, None, &trial_order());
        assert_eq!(text, "中文");
        assert_eq!(adopted, Some(GBK));

        // Subsequent chunks reuse the sticky encoding without retrying.
        let (text, adopted) = decode_chunk(GBK_BYTES, adopted, &trial_order());
        assert_eq!(text, "中文");
        assert_eq!(adopted, Some(GBK));
    }

    #[test]
    fn failing_sticky_encoding_triggers_redetection() {
        let (text, adopted) = decode_chunk(GBK_BYTES, Some(UTF_8), &trial_order());
        assert_eq!(text, "中文");
        assert_eq!(adopted, Some(GBK));
    }

    #[test]
    fn undecodable_input_is_substituted_not_dropped() {
        let bytes = [0xff, 0xff];
        let (text, adopted) = decode_chunk(&bytes, None, &trial_order());
        assert!(!text.is_empty());
        assert!(text.contains('\u{fffd}'));
        assert_eq!(adopted, None);
    }

    #[test]
    fn candidate_list_is_deduplicated_and_covers_the_cjk_decoders() {
        let candidates = candidate_encodings();
        assert!(candidates.contains(&UTF_8));
        assert!(candidates.contains(&GBK));
        assert!(candidates.contains(&BIG5));
        for (index, encoding) in candidates.iter().enumerate() {
            assert!(!candidates[..index].contains(encoding));
        }
    }
}
