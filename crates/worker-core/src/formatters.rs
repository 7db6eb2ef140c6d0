//! Naming and classification helpers shared by the deploy pipeline and the
//! reconcilers. Everything here is pure so it can be exercised without a
//! cluster.

const MAX_NAME_LEN: usize = 63;

/// Makes a project name safe for Kubernetes object names and DNS-1123
/// labels: lowercase `[a-z0-9-]`, at most 63 chars, starts with a letter,
/// no trailing dash, never empty. Runs of other characters collapse into a
/// single dash.
pub fn sanitize_k8s_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len().min(MAX_NAME_LEN));
    let mut last_was_dash = true;

    for c in name.chars() {
        if result.len() >= MAX_NAME_LEN {
            break;
        }
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            result.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            result.push('-');
            last_was_dash = true;
        }
    }

    while result.ends_with('-') {
        result.pop();
    }

    if result.starts_with(|c: char| c.is_ascii_digit()) {
        result.insert(0, 'a');
        result.truncate(MAX_NAME_LEN);
        while result.ends_with('-') {
            result.pop();
        }
    }

    if result.is_empty() {
        result.push_str("app");
    }

    result
}

/// Appends a role suffix to an app name, trimming the base so the result
/// stays within the 63-char limit.
pub fn name_with_suffix(base: &str, suffix: &str) -> String {
    let base = if base.is_empty() { "app" } else { base };

    if base.len() + suffix.len() <= MAX_NAME_LEN {
        return format!("{}{}", base.trim_end_matches('-'), suffix);
    }

    let trim_len = MAX_NAME_LEN.saturating_sub(suffix.len());
    if trim_len < 1 {
        return suffix[suffix.len() - MAX_NAME_LEN..].to_string();
    }

    let mut trimmed = base[..trim_len].trim_end_matches('-');
    if trimmed.is_empty() {
        trimmed = "app";
    }
    format!("{trimmed}{suffix}")
}

pub fn service_account_name(app_name: &str) -> String {
    name_with_suffix(app_name, "-sa")
}

pub fn network_policy_name(app_name: &str) -> String {
    name_with_suffix(app_name, "-netpol")
}

pub fn custom_tls_secret_name(app_name: &str) -> String {
    name_with_suffix(app_name, "-custom-tls")
}

/// Normalises a requested domain to a bare lowercase host.
pub fn sanitize_host(host: &str) -> String {
    let host = host
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or_default();
    host.to_lowercase()
}

/// A host is a platform subdomain when it equals the base domain or sits
/// under it. Platform subdomains are covered by the shared wildcard TLS
/// secret; everything else needs its own certificate.
pub fn is_platform_subdomain(host: &str, base_domain: &str) -> bool {
    if base_domain.is_empty() {
        return false;
    }
    let host = host.to_lowercase();
    let base = base_domain.to_lowercase();
    host == base || host.ends_with(&format!(".{base}"))
}

/// Short identifier from a full pod name, used as the runtime log prefix.
/// `portfolio-v2-6d64886bbb-5q8tk` -> `5q8tk`
pub fn short_pod_name(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((_, tail)) => tail,
        None => name,
    }
}

/// Removes the RFC3339Nano timestamp Kubernetes prepends to log lines when
/// timestamps are enabled, e.g. `2026-02-08T00:54:51.145175868Z hello`.
pub fn strip_pod_log_timestamp(line: &str) -> &str {
    if let Some(idx) = line.find("Z ") {
        if idx > 0
            && idx <= 35
            && line.starts_with(|c: char| c.is_ascii_digit())
        {
            return &line[idx + 2..];
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_name(name: &str) {
        assert!(!name.is_empty(), "name must not be empty");
        assert!(name.len() <= 63, "name too long: {name}");
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "invalid chars in {name}"
        );
        assert!(name.starts_with(|c: char| c.is_ascii_lowercase()), "bad start: {name}");
        assert!(!name.ends_with('-'), "trailing dash: {name}");
    }

    #[test]
    fn sanitize_lowercases_and_collapses() {
        assert_eq!(sanitize_k8s_name("My Cool App"), "my-cool-app");
        assert_eq!(sanitize_k8s_name("demo"), "demo");
        assert_eq!(sanitize_k8s_name("foo__bar..baz"), "foo-bar-baz");
    }

    #[test]
    fn sanitize_handles_hostile_inputs() {
        for input in [
            "",
            "---",
            "   ",
            "123-app",
            "UPPER",
            "a".repeat(200).as_str(),
            "émoji🚀name",
            "-leading-dash",
            "trailing-dash-",
            "9",
        ] {
            assert_valid_name(&sanitize_k8s_name(input));
        }
    }

    #[test]
    fn sanitize_prefixes_digit_start() {
        assert_eq!(sanitize_k8s_name("123abc"), "a123abc");
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_k8s_name(""), "app");
        assert_eq!(sanitize_k8s_name("!!!"), "app");
    }

    #[test]
    fn suffix_names_stay_within_limit() {
        let long = "a".repeat(80);
        for name in [
            service_account_name(&long),
            network_policy_name(&long),
            custom_tls_secret_name(&long),
        ] {
            assert!(name.len() <= 63, "{name}");
        }
        assert_eq!(service_account_name("demo"), "demo-sa");
        assert_eq!(network_policy_name("demo"), "demo-netpol");
        assert_eq!(custom_tls_secret_name("demo"), "demo-custom-tls");
    }

    #[test]
    fn host_sanitization_strips_scheme_and_path() {
        assert_eq!(sanitize_host("https://Demo.Example.COM/path"), "demo.example.com");
        assert_eq!(sanitize_host("http://foo.bar"), "foo.bar");
        assert_eq!(sanitize_host("plain.host"), "plain.host");
    }

    #[test]
    fn subdomain_classification() {
        let base = "preview.example.com";
        assert!(is_platform_subdomain("app.preview.example.com", base));
        assert!(is_platform_subdomain("PREVIEW.EXAMPLE.COM", base));
        assert!(is_platform_subdomain("a.b.preview.example.com", base));
        assert!(!is_platform_subdomain("app.customer.com", base));
        // A suffix match must fall on a label boundary.
        assert!(!is_platform_subdomain("evilpreview.example.com", base));
        assert!(!is_platform_subdomain("anything.at.all", ""));
    }

    #[test]
    fn short_pod_names() {
        assert_eq!(short_pod_name("demo-6d64886bbb-5q8tk"), "5q8tk");
        assert_eq!(short_pod_name("single"), "single");
    }

    #[test]
    fn strips_pod_log_timestamps() {
        assert_eq!(
            strip_pod_log_timestamp("2026-02-08T00:54:51.145175868Z hello world"),
            "hello world"
        );
        assert_eq!(strip_pod_log_timestamp("no timestamp here"), "no timestamp here");
        // A "Z " beyond the prefix window is left alone.
        let line = "data data data data data data data data Z tail";
        assert_eq!(strip_pod_log_timestamp(line), line);
        // Must start with a digit to count as a timestamp.
        assert_eq!(strip_pod_log_timestamp("xyzZ tail"), "xyzZ tail");
    }
}
