//! Country to preferred-region mapping.

/// Returns the preferred region for an ISO-2 country code.
///
/// Lookup is case-insensitive. Unknown countries (including the
/// `"unknown"` sentinel) return `None`, which disables regional
/// narrowing for the request.
pub fn preferred_region(country: &str) -> Option<&'static str> {
    let code = country.to_ascii_uppercase();
    let region = match code.as_str() {
        "CN" | "HK" | "TW" => "asia-east",
        "JP" | "KR" => "asia-northeast",
        "SG" | "MY" | "TH" | "ID" | "PH" | "VN" => "asia-southeast",
        "IN" | "PK" | "BD" => "asia-south",
        "US" | "CA" => "us-west",
        "MX" => "americas-north",
        "BR" | "AR" | "CL" => "americas-south",
        "GB" | "DE" | "FR" | "NL" | "IT" | "ES" => "europe-west",
        "PL" | "CZ" | "RU" => "europe-east",
        "AU" | "NZ" => "oceania",
        _ => return None,
    };
    Some(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_countries() {
        assert_eq!(preferred_region("JP"), Some("asia-northeast"));
        assert_eq!(preferred_region("CN"), Some("asia-east"));
        assert_eq!(preferred_region("SG"), Some("asia-southeast"));
        assert_eq!(preferred_region("IN"), Some("asia-south"));
        assert_eq!(preferred_region("US"), Some("us-west"));
        assert_eq!(preferred_region("MX"), Some("americas-north"));
        assert_eq!(preferred_region("BR"), Some("americas-south"));
        assert_eq!(preferred_region("DE"), Some("europe-west"));
        assert_eq!(preferred_region("PL"), Some("europe-east"));
        assert_eq!(preferred_region("AU"), Some("oceania"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(preferred_region("jp"), Some("asia-northeast"));
        assert_eq!(preferred_region("Us"), Some("us-west"));
    }

    #[test]
    fn test_unknown_countries_have_no_region() {
        assert_eq!(preferred_region("ZZ"), None);
        assert_eq!(preferred_region("unknown"), None);
        assert_eq!(preferred_region(""), None);
    }
}
