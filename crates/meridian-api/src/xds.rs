mod cluster;
mod endpoint;
mod filter;
mod listener;
mod route;

use std::str::FromStr;

use xds_api::pb::{
    envoy::{
        config::{core::v3 as xds_core, route::v3 as xds_route},
        r#type::{
            matcher::v3::{string_matcher::MatchPattern, RegexMatcher, StringMatcher},
            v3 as xds_type,
        },
    },
    google::protobuf,
};

use crate::{
    error::{Error, ErrorContext},
    matcher::{self, HeaderMatchKind, HeaderMatcher, StringPattern},
    Denominator, Duration, FractionalPercent, Regex,
};

/// Returns `true` if a config source points at the ADS stream or at the
/// server that sent the resource containing it. Those are the only config
/// sources a client can follow.
pub(crate) fn is_ads_or_self(source: &xds_core::ConfigSource) -> bool {
    use xds_core::config_source::ConfigSourceSpecifier;

    matches!(
        source.config_source_specifier,
        Some(ConfigSourceSpecifier::Ads(_)) | Some(ConfigSourceSpecifier::Self_(_))
    )
}

pub(crate) fn is_self(source: &xds_core::ConfigSource) -> bool {
    use xds_core::config_source::ConfigSourceSpecifier;

    matches!(
        source.config_source_specifier,
        Some(ConfigSourceSpecifier::Self_(_))
    )
}

/// Returns `true` if an `Any` holds a message of type `M`.
pub(crate) fn is_type<M: prost::Name>(any: &protobuf::Any) -> bool {
    any.type_url == M::type_url()
}

pub(crate) fn parse_regex(p: &RegexMatcher) -> Result<Regex, Error> {
    Regex::from_str(&p.regex)
        .map_err(|e| Error::new(format!("invalid regex: {e}")))
        .with_field("regex")
}

pub(crate) fn duration_from_xds(d: &protobuf::Duration) -> Result<Duration, Error> {
    if d.seconds < 0 || d.nanos < 0 {
        return Err(Error::new_static("duration cannot be negative"));
    }
    if d.nanos >= 1_000_000_000 {
        return Err(Error::new_static("duration nanos out of range"));
    }

    Ok(Duration::new(d.seconds as u64, d.nanos as u32))
}

pub(crate) fn fractional_percent_from_xds(
    p: &xds_type::FractionalPercent,
) -> Result<FractionalPercent, Error> {
    use xds_type::fractional_percent::DenominatorType;

    let denominator = match DenominatorType::try_from(p.denominator) {
        Ok(DenominatorType::Hundred) => Denominator::Hundred,
        Ok(DenominatorType::TenThousand) => Denominator::TenThousand,
        Ok(DenominatorType::Million) => Denominator::Million,
        Err(_) => {
            return Err(Error::new(format!(
                "unknown denominator type: {}",
                p.denominator
            )))
            .with_field("denominator")
        }
    };

    Ok(FractionalPercent {
        numerator: p.numerator,
        denominator,
    })
}

pub(crate) fn string_matcher_from_xds(m: &StringMatcher) -> Result<matcher::StringMatcher, Error> {
    let pattern = match &m.match_pattern {
        Some(MatchPattern::Exact(s)) => StringPattern::Exact(s.clone()),
        Some(MatchPattern::Prefix(s)) => StringPattern::Prefix(s.clone()),
        Some(MatchPattern::Suffix(s)) => StringPattern::Suffix(s.clone()),
        Some(MatchPattern::Contains(s)) => StringPattern::Contains(s.clone()),
        Some(MatchPattern::SafeRegex(r)) => {
            StringPattern::Regex(parse_regex(r).with_field("safe_regex")?)
        }
        Some(_) => return Err(Error::new_static("unsupported string matcher")),
        None => return Err(Error::new_static("missing match pattern")),
    };

    Ok(matcher::StringMatcher {
        pattern,
        ignore_case: m.ignore_case,
    })
}

pub(crate) fn header_matcher_from_xds(m: &xds_route::HeaderMatcher) -> Result<HeaderMatcher, Error> {
    use xds_route::header_matcher::HeaderMatchSpecifier;

    if m.name.is_empty() {
        return Err(Error::new_static("header name cannot be empty")).with_field("name");
    }

    // NOTE: header_match_specifier is a oneof, so each branch names its own
    // field in errors.
    let kind = match &m.header_match_specifier {
        Some(HeaderMatchSpecifier::ExactMatch(v)) => {
            HeaderMatchKind::String(matcher::StringMatcher::exact(v.clone()))
        }
        Some(HeaderMatchSpecifier::SafeRegexMatch(r)) => HeaderMatchKind::String(
            matcher::StringMatcher {
                pattern: StringPattern::Regex(parse_regex(r).with_field("safe_regex_match")?),
                ignore_case: false,
            },
        ),
        Some(HeaderMatchSpecifier::RangeMatch(range)) => {
            if range.start > range.end {
                return Err(Error::new_static("range start must not be after end"))
                    .with_field("range_match");
            }
            HeaderMatchKind::Range {
                start: range.start,
                end: range.end,
            }
        }
        Some(HeaderMatchSpecifier::PresentMatch(present)) => HeaderMatchKind::Present(*present),
        Some(HeaderMatchSpecifier::PrefixMatch(p)) => HeaderMatchKind::String(
            matcher::StringMatcher::prefix(p.clone()),
        ),
        Some(HeaderMatchSpecifier::SuffixMatch(s)) => {
            HeaderMatchKind::String(matcher::StringMatcher {
                pattern: StringPattern::Suffix(s.clone()),
                ignore_case: false,
            })
        }
        Some(HeaderMatchSpecifier::ContainsMatch(s)) => {
            HeaderMatchKind::String(matcher::StringMatcher {
                pattern: StringPattern::Contains(s.clone()),
                ignore_case: false,
            })
        }
        Some(HeaderMatchSpecifier::StringMatch(s)) => {
            HeaderMatchKind::String(string_matcher_from_xds(s).with_field("string_match")?)
        }
        // envoy treats a matcher with no specifier as a presence match
        None => HeaderMatchKind::Present(true),
    };

    Ok(HeaderMatcher {
        name: m.name.clone(),
        kind,
        invert: m.invert_match,
    })
}
