// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Custom AWS service endpoints.
//!
//! The `--service-endpoints` flag takes semicolon separated signing region
//! groups, each listing comma separated `service=url` pairs:
//!
//! ```text
//! eu-west-1:eks=https://eks.eu-west-1.example,sts=https://sts.example;us-east-1:iam=https://iam.example
//! ```

use std::fmt;

use url::Url;

/// Errors produced while parsing the service endpoint flag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty signing region group at position {0}")]
    EmptyGroup(usize),

    #[error("group {0:?} is missing the `<region>:` prefix")]
    MissingRegion(String),

    #[error("group {0:?} has an empty signing region")]
    EmptyRegion(String),

    #[error("invalid signing region {0:?}")]
    InvalidRegion(String),

    #[error("signing region {0} lists no service endpoints")]
    MissingServices(String),

    #[error("empty service endpoint in signing region {0}")]
    EmptyPair(String),

    #[error("service endpoint {0:?} is missing `=`")]
    MissingEquals(String),

    #[error("service endpoint {0:?} has an empty service identifier")]
    EmptyServiceId(String),

    #[error("invalid service identifier {0:?}")]
    InvalidServiceId(String),

    #[error("invalid URL {url:?} for service {service_id}: {reason}")]
    InvalidUrl {
        service_id: String,
        url: String,
        reason: String,
    },
}

/// A single endpoint override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Region used when signing requests to this endpoint.
    pub signing_region: String,
    /// AWS service identifier, e.g. `eks`, `iam`, `sts`.
    pub service_id: String,
    /// Endpoint URL exactly as given on the command line.
    pub url: String,
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.signing_region, self.service_id, self.url)
    }
}

/// Ordered list of endpoint overrides.
///
/// Duplicate service identifiers within a region are kept; lookups return
/// the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEndpointMap {
    endpoints: Vec<ServiceEndpoint>,
}

impl ServiceEndpointMap {
    /// Returns true when no override is configured.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Number of overrides, duplicates included.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Iterates the overrides in flag order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints.iter()
    }

    /// Looks up the override for a service in a signing region.
    pub fn resolve(&self, signing_region: &str, service_id: &str) -> Option<&ServiceEndpoint> {
        self.endpoints
            .iter()
            .rev()
            .find(|e| e.signing_region == signing_region && e.service_id == service_id)
    }

    /// Returns the overrides of one signing region in flag order.
    pub fn for_region<'a>(
        &'a self,
        signing_region: &'a str,
    ) -> impl Iterator<Item = &'a ServiceEndpoint> + 'a {
        self.endpoints
            .iter()
            .filter(move |e| e.signing_region == signing_region)
    }

    /// Returns the distinct signing regions in order of first appearance.
    pub fn regions(&self) -> Vec<&str> {
        let mut regions: Vec<&str> = Vec::new();
        for e in &self.endpoints {
            if !regions.contains(&e.signing_region.as_str()) {
                regions.push(&e.signing_region);
            }
        }
        regions
    }
}

impl<'a> IntoIterator for &'a ServiceEndpointMap {
    type Item = &'a ServiceEndpoint;
    type IntoIter = std::slice::Iter<'a, ServiceEndpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

/// Parses the `--service-endpoints` flag.
///
/// Empty input yields an empty map. Malformed input fails as a whole.
pub fn parse(spec: &str) -> Result<ServiceEndpointMap, ParseError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(ServiceEndpointMap::default());
    }

    let groups: Vec<&str> = spec.split(';').collect();
    let mut endpoints = Vec::new();

    for (idx, group) in groups.iter().enumerate() {
        let group = group.trim();
        if group.is_empty() {
            // a single trailing ';' is accepted
            if idx == groups.len() - 1 && idx > 0 {
                continue;
            }
            return Err(ParseError::EmptyGroup(idx));
        }
        parse_group(group, &mut endpoints)?;
    }

    Ok(ServiceEndpointMap { endpoints })
}

fn parse_group(group: &str, out: &mut Vec<ServiceEndpoint>) -> Result<(), ParseError> {
    let (region, services) = match group.split_once(':') {
        Some(split) => split,
        None if group.contains('=') => return Err(ParseError::MissingRegion(group.to_string())),
        None => return Err(ParseError::MissingServices(group.trim().to_string())),
    };

    let region = region.trim();
    // the first ':' belongs to a URL
    if region.contains('=') {
        return Err(ParseError::MissingRegion(group.to_string()));
    }
    if region.is_empty() {
        return Err(ParseError::EmptyRegion(group.to_string()));
    }
    if !region
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ParseError::InvalidRegion(region.to_string()));
    }

    if services.trim().is_empty() {
        return Err(ParseError::MissingServices(region.to_string()));
    }

    let pairs: Vec<&str> = services.split(',').collect();
    for (idx, pair) in pairs.iter().enumerate() {
        let pair = pair.trim();
        if pair.is_empty() {
            // a single trailing ',' is accepted
            if idx == pairs.len() - 1 && idx > 0 {
                continue;
            }
            return Err(ParseError::EmptyPair(region.to_string()));
        }
        out.push(parse_pair(region, pair)?);
    }
    Ok(())
}

fn parse_pair(region: &str, pair: &str) -> Result<ServiceEndpoint, ParseError> {
    let (service_id, url) = pair
        .split_once('=')
        .ok_or_else(|| ParseError::MissingEquals(pair.to_string()))?;

    let service_id = service_id.trim();
    let url = url.trim();

    if service_id.is_empty() {
        return Err(ParseError::EmptyServiceId(pair.to_string()));
    }
    if !service_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ParseError::InvalidServiceId(service_id.to_string()));
    }

    validate_url(service_id, url)?;

    Ok(ServiceEndpoint {
        signing_region: region.to_string(),
        service_id: service_id.to_string(),
        url: url.to_string(),
    })
}

fn validate_url(service_id: &str, raw: &str) -> Result<(), ParseError> {
    let invalid = |reason: String| ParseError::InvalidUrl {
        service_id: service_id.to_string(),
        url: raw.to_string(),
        reason,
    };

    let parsed = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   ").unwrap().is_empty());
    }

    #[test]
    fn test_single_override() {
        let map = parse("us-east-1:iam=https://x").unwrap();
        assert_eq!(map.len(), 1);

        let endpoint = map.iter().next().unwrap();
        assert_eq!(endpoint.signing_region, "us-east-1");
        assert_eq!(endpoint.service_id, "iam");
        assert_eq!(endpoint.url, "https://x");
    }

    #[test]
    fn test_multiple_regions() {
        let map = parse(
            "eu-west-1:eks=https://eks.eu-west-1.example,sts=https://sts.example;us-east-1:iam=https://iam.example",
        )
        .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.regions(), vec!["eu-west-1", "us-east-1"]);
        assert_eq!(map.for_region("eu-west-1").count(), 2);
        assert_eq!(
            map.resolve("us-east-1", "iam").map(|e| e.url.as_str()),
            Some("https://iam.example")
        );
        assert!(map.resolve("us-east-1", "eks").is_none());
    }

    #[test]
    fn test_duplicate_service_last_wins() {
        let map = parse("us-east-1:iam=https://first.example,iam=https://second.example").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.resolve("us-east-1", "iam").map(|e| e.url.as_str()),
            Some("https://second.example")
        );
    }

    #[test]
    fn test_trailing_delimiters() {
        assert_eq!(parse("us-east-1:iam=https://x;").unwrap().len(), 1);
        assert_eq!(parse("us-east-1:iam=https://x,").unwrap().len(), 1);
    }

    #[test]
    fn test_url_with_port_and_path() {
        let map = parse("us-west-2:ec2=http://localhost:4566/ec2").unwrap();
        assert_eq!(map.iter().next().unwrap().url, "http://localhost:4566/ec2");
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(parse("us-east-1"), Err(ParseError::MissingServices(_))));
        assert!(matches!(parse("us-east-1:"), Err(ParseError::MissingServices(_))));
        assert!(matches!(parse("=https://x"), Err(ParseError::MissingRegion(_))));
        assert!(matches!(
            parse("us-east-1:=https://x"),
            Err(ParseError::EmptyServiceId(_))
        ));
        assert!(matches!(
            parse(":iam=https://x"),
            Err(ParseError::EmptyRegion(_))
        ));
        assert!(matches!(
            parse("us-east-1:iam"),
            Err(ParseError::MissingEquals(_))
        ));
        assert!(matches!(
            parse("us-east-1:iam=https://x;;eu-west-1:eks=https://y"),
            Err(ParseError::EmptyGroup(1))
        ));
        assert!(matches!(
            parse("us-east-1:iam=https://x,,eks=https://y"),
            Err(ParseError::EmptyPair(_))
        ));
        assert!(matches!(parse(";"), Err(ParseError::EmptyGroup(0))));
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            parse("us-east-1:iam=not a url"),
            Err(ParseError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse("us-east-1:iam=ftp://iam.example"),
            Err(ParseError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let spec = "eu-west-1:eks=https://eks.example;us-east-1:iam=https://iam.example";
        assert_eq!(parse(spec).unwrap(), parse(spec).unwrap());
    }
}
