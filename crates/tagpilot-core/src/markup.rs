//! Pure URL and markup builders.
//!
//! Framework adapters consume these instead of reimplementing escaping or
//! parameter merging. Nothing here touches the host.

use crate::types::ContainerDescriptor;
use crate::DEFAULT_DATA_LAYER_NAME;

const DEFAULT_IFRAME_ATTRIBUTES: [(&str, &str); 3] = [
    ("height", "0"),
    ("width", "0"),
    ("style", "display:none;visibility:hidden"),
];

/// Strip exactly one trailing slash.
pub fn normalize_host(host: &str) -> &str {
    host.strip_suffix('/').unwrap_or(host)
}

/// Percent-encode with `encodeURIComponent` semantics.
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Escape `&`, `"`, `<` and `>` for use in attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn query(container: &ContainerDescriptor) -> String {
    let mut query = format!("id={}", encode_uri_component(&container.id));
    for (key, value) in &container.query_params {
        query.push('&');
        query.push_str(&encode_uri_component(key));
        query.push('=');
        query.push_str(&encode_uri_component(value));
    }
    query
}

/// `{host}/gtm.js?id=...[&params][&l=name]`; `l` only for non-default names.
pub fn script_url(host: &str, container: &ContainerDescriptor, data_layer_name: &str) -> String {
    let mut url = format!("{}/gtm.js?{}", normalize_host(host), query(container));
    if data_layer_name != DEFAULT_DATA_LAYER_NAME {
        url.push_str("&l=");
        url.push_str(&encode_uri_component(data_layer_name));
    }
    url
}

/// `{host}/ns.html?id=...[&params]`.
pub fn noscript_url(host: &str, container: &ContainerDescriptor) -> String {
    format!("{}/ns.html?{}", normalize_host(host), query(container))
}

/// `<noscript><iframe ...></iframe></noscript>` for one container.
///
/// `overrides` replace default iframe attributes by name or add new ones.
pub fn noscript_markup(
    host: &str,
    container: &ContainerDescriptor,
    overrides: &[(String, String)],
) -> String {
    let mut attributes: Vec<(String, String)> = DEFAULT_IFRAME_ATTRIBUTES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (key, value) in overrides {
        if key == "src" {
            continue;
        }
        match attributes.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => attributes.push((key.clone(), value.clone())),
        }
    }

    let mut markup = format!(
        "<noscript><iframe src=\"{}\"",
        escape_html(&noscript_url(host, container))
    );
    for (key, value) in &attributes {
        markup.push_str(&format!(" {}=\"{}\"", escape_html(key), escape_html(value)));
    }
    markup.push_str("></iframe></noscript>");
    markup
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_url_default_layer() {
        let container = ContainerDescriptor::new("GTM-ABC123");
        assert_eq!(
            script_url("https://www.googletagmanager.com/", &container, "dataLayer"),
            "https://www.googletagmanager.com/gtm.js?id=GTM-ABC123"
        );
    }

    #[test]
    fn test_script_url_custom_layer_and_params() {
        let container = ContainerDescriptor::new("GTM-ABC123")
            .with_query_param("gtm_auth", "a b&c")
            .with_query_param("gtm_preview", "env-4");
        assert_eq!(
            script_url("https://tags.example.com", &container, "myLayer"),
            "https://tags.example.com/gtm.js?id=GTM-ABC123&gtm_auth=a%20b%26c&gtm_preview=env-4&l=myLayer"
        );
    }

    #[test]
    fn test_only_one_trailing_slash_is_stripped() {
        assert_eq!(normalize_host("https://x.test//"), "https://x.test/");
    }

    #[test]
    fn test_noscript_markup_escapes_attributes() {
        let container = ContainerDescriptor::new("GTM-ABC123").with_query_param("a", "1");
        let markup = noscript_markup(
            "https://www.googletagmanager.com",
            &container,
            &[("title".to_string(), "\"tags\" <x>".to_string())],
        );
        assert_eq!(
            markup,
            "<noscript><iframe src=\"https://www.googletagmanager.com/ns.html?id=GTM-ABC123&amp;a=1\" \
             height=\"0\" width=\"0\" style=\"display:none;visibility:hidden\" \
             title=\"&quot;tags&quot; &lt;x&gt;\"></iframe></noscript>"
        );
    }

    #[test]
    fn test_noscript_overrides_replace_defaults() {
        let container = ContainerDescriptor::new("GTM-ABC123");
        let markup = noscript_markup(
            "https://www.googletagmanager.com",
            &container,
            &[("height".to_string(), "1".to_string())],
        );
        assert!(markup.contains("height=\"1\""));
        assert!(!markup.contains("height=\"0\""));
    }

    #[test]
    fn test_encode_uri_component_utf8() {
        assert_eq!(encode_uri_component("é/?"), "%C3%A9%2F%3F");
    }
}
