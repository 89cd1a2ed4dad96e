//! PLMN (MCC+MNC) to carrier name lookup.

/// Carrier name for a 5-digit PLMN code, if known.
pub fn operator_name(plmn: &str) -> Option<&'static str> {
    let name = match plmn {
        // China
        "46000" | "46002" | "46004" | "46007" | "46008" | "46013" => "China Mobile",
        "46001" | "46006" | "46009" | "46010" => "China Unicom",
        "46003" | "46005" | "46011" | "46012" => "China Telecom",
        "46015" => "China Broadnet",
        "46020" => "China Tietong",
        // Hong Kong / Macau / Taiwan
        "45400" | "45402" | "45410" | "45418" => "CSL",
        "45403" | "45404" => "3 Hong Kong",
        "45406" | "45415" | "45417" => "SmarTone",
        "45412" | "45413" => "China Mobile Hong Kong",
        "45500" => "SmarTone Macau",
        "45501" | "45504" => "CTM",
        "46692" => "Chunghwa Telecom",
        "46601" => "Far EasTone",
        "46697" => "Taiwan Mobile",
        // Elsewhere
        "44010" => "NTT docomo",
        "44020" => "SoftBank",
        "44050" | "44051" => "KDDI au",
        "45005" => "SK Telecom",
        "45008" => "KT",
        "45006" => "LG U+",
        "52501" => "Singtel",
        "31026" => "T-Mobile US",
        "31041" => "AT&T",
        "23410" => "O2 UK",
        "23415" => "Vodafone UK",
        "26201" => "Telekom.de",
        _ => return None,
    };
    Some(name)
}

/// Operator display value derived from an IMSI: the mapped carrier name, or the
/// raw 5-digit code when unmapped. `None` when the IMSI is too short to carry a
/// PLMN prefix, in which case whatever the device reported is kept.
pub fn resolve_operator(imsi: &str) -> Option<String> {
    if imsi.len() <= 5 || !imsi.is_char_boundary(5) {
        return None;
    }
    let plmn = &imsi[..5];
    Some(
        operator_name(plmn)
            .map(str::to_string)
            .unwrap_or_else(|| plmn.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_codes() {
        assert_eq!(resolve_operator("460011234567890").as_deref(), Some("China Unicom"));
        assert_eq!(resolve_operator("460001234567890").as_deref(), Some("China Mobile"));
    }

    #[test]
    fn unmapped_code_falls_back_to_plmn() {
        assert_eq!(resolve_operator("999991234567890").as_deref(), Some("99999"));
    }

    #[test]
    fn short_imsi_is_ignored() {
        assert_eq!(resolve_operator(""), None);
        assert_eq!(resolve_operator("46000"), None);
    }
}
