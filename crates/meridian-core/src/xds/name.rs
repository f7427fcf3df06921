//! Resource names and xDS federation.
//!
//! Resource names are either plain strings, which are always fetched from the
//! default server, or `xdstp://` URIs that name the authority responsible for
//! serving them.
//!
//! <https://github.com/grpc/proposal/blob/master/A47-xds-federation.md>

use crate::{
    bootstrap::Bootstrap,
    error::{Error, Result},
    xds::ResourceType,
};

const XDSTP_SCHEME: &str = "xdstp://";

/// A parsed resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct XdsName {
    /// The authority the name belongs to. Old-style names have no authority.
    pub authority: Option<String>,

    /// The name to use on the wire. `xdstp` names have their query parameters
    /// sorted so that equivalent names compare equal.
    pub canonical: String,
}

impl XdsName {
    pub(crate) fn parse(resource_type: ResourceType, name: &str) -> Result<Self> {
        let Some(rest) = name.strip_prefix(XDSTP_SCHEME) else {
            return Ok(Self {
                authority: None,
                canonical: name.to_string(),
            });
        };

        let invalid = || Error::InvalidResourceName(name.to_string());

        // fragments are never part of a resource name
        let rest = rest.split_once('#').map(|(r, _)| r).unwrap_or(rest);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = path.split_once('/').ok_or_else(invalid)?;
        let (type_name, id) = path.split_once('/').ok_or_else(invalid)?;
        if type_name != resource_type.type_name() {
            return Err(invalid());
        }

        let mut canonical = format!("{XDSTP_SCHEME}{authority}/{type_name}/{id}");
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            let mut params: Vec<_> = form_urlencoded::parse(query.as_bytes()).collect();
            params.sort();

            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish();
            canonical.push('?');
            canonical.push_str(&query);
        }

        Ok(Self {
            authority: Some(authority.to_string()),
            canonical,
        })
    }
}

/// Build the listener name for a target.
///
/// Uses the authority's listener name template when the target names an
/// authority, and the bootstrap's default template otherwise. Target names
/// are percent-encoded before being substituted into an `xdstp` template.
pub(crate) fn listener_name(
    bootstrap: &Bootstrap,
    authority: Option<&str>,
    target: &str,
) -> Result<String> {
    let template = match authority {
        Some(authority) => {
            let config = bootstrap
                .authorities
                .get(authority)
                .ok_or_else(|| Error::UnknownAuthority(authority.to_string()))?;

            config
                .client_listener_resource_name_template
                .clone()
                .unwrap_or_else(|| {
                    format!(
                        "{XDSTP_SCHEME}{authority}/{}/%s",
                        ResourceType::Listener.type_name()
                    )
                })
        }
        None => bootstrap
            .client_default_listener_resource_name_template
            .clone()
            .unwrap_or_else(|| "%s".to_string()),
    };

    let target = match template.starts_with(XDSTP_SCHEME) {
        true => percent_encode_path(target.trim_start_matches('/')),
        false => target.to_string(),
    };

    Ok(template.replace("%s", &target))
}

fn percent_encode_path(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                encoded.push(b as char)
            }
            _ => encoded.push_str(&format!("%{b:02X}")),
        }
    }
    encoded
}
