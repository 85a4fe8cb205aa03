/// Normalize a destination into provider-accepted digits: strip the JID
/// domain and all non-digits, then fix up the country code (`0` prefix and
/// bare local numbers become `62`).
pub fn normalize_phone(raw: &str) -> String {
    let local = raw.split('@').next().unwrap_or(raw);
    let digits: String = local.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return digits;
    }
    if let Some(rest) = digits.strip_prefix('0') {
        return format!("62{rest}");
    }
    if !digits.starts_with("62") {
        return format!("62{digits}");
    }
    digits
}

/// The bare number part of a JID (`628111@s.whatsapp.net` → `628111`).
pub fn strip_jid(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Minimal vCard 3.0 for a contact share. The first whitespace token is the
/// given name, the remainder the family name.
pub fn build_vcard(full_name: &str, phone: &str) -> String {
    let name = full_name.trim();
    let (given, family) = match name.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (name, ""),
    };
    let number = normalize_phone(phone);

    format!(
        "BEGIN:VCARD\nVERSION:3.0\nN:{family};{given};;;\nFN:{name}\nTEL;type=CELL;type=pref:+{number}\nEND:VCARD"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_jid_suffix_and_punctuation() {
        assert_eq!(normalize_phone("628111222333@s.whatsapp.net"), "628111222333");
        assert_eq!(normalize_phone("+62 811-1222-333"), "628111222333");
    }

    #[test]
    fn leading_zero_becomes_country_code() {
        assert_eq!(normalize_phone("08111222333"), "628111222333");
    }

    #[test]
    fn bare_local_number_gets_country_code() {
        assert_eq!(normalize_phone("8111222333"), "628111222333");
        assert_eq!(normalize_phone("628111222333"), "628111222333");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_phone("not-a-number"), "");
    }

    #[test]
    fn vcard_splits_first_token_and_keeps_tel_line() {
        let card = build_vcard("Budi Santoso Wijaya", "08111222333");
        assert!(card.contains("N:Santoso Wijaya;Budi;;;"));
        assert!(card.contains("FN:Budi Santoso Wijaya"));
        assert!(card.contains("TEL;type=CELL;type=pref:+628111222333"));
    }

    #[test]
    fn vcard_single_token_name() {
        let card = build_vcard("Siti", "628999");
        assert!(card.contains("N:;Siti;;;"));
        assert!(card.contains("FN:Siti"));
    }
}
