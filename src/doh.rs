//! DNS-over-HTTPS transport.
//!
//! Queries are RFC 8484 wire-format messages sent with POST and
//! `application/dns-message`. Only A, AAAA and NS answers are read.
//!
//! Address queries can carry an EDNS client subnet (RFC 7871) so that
//! providers honouring it answer as they would for a client inside that
//! network, rather than for the host running the bot.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
use hickory_proto::rr::{Name, RData, RecordType};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::DohError;

/// DoH content type for DNS wire format
const DNS_MESSAGE: &str = "application/dns-message";

/// EDNS UDP payload size advertised with the OPT record
const EDNS_PAYLOAD: u16 = 1232;

/// Default client subnet for address queries (China Telecom, Nanjing).
pub const DEFAULT_CLIENT_SUBNET: &str = "114.114.114.0/24";

/// A named DoH endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DohProvider {
    pub name: String,
    pub url: String,
}

impl DohProvider {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for DohProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Record type asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Address records (A, plus any AAAA the provider returns)
    A,
    /// Name server records
    Ns,
}

impl QueryKind {
    fn record_type(self) -> RecordType {
        match self {
            QueryKind::A => RecordType::A,
            QueryKind::Ns => RecordType::NS,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::A => f.write_str("A"),
            QueryKind::Ns => f.write_str("NS"),
        }
    }
}

/// Answer section content relevant to classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved addresses
    pub addrs: Vec<IpAddr>,
    /// Name server hosts, lower-case without the trailing dot
    pub names: Vec<String>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.names.is_empty()
    }
}

/// Sends one DNS question to one provider.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn query(
        &self,
        provider: &DohProvider,
        name: &str,
        kind: QueryKind,
    ) -> Result<Resolution, DohError>;
}

/// [`DnsTransport`] over reqwest.
pub struct HttpDohTransport {
    client: reqwest::Client,
    client_subnet: Option<IpNet>,
}

impl HttpDohTransport {
    /// Create a transport. `timeout` bounds each HTTP exchange.
    pub fn new(timeout: Duration) -> Result<Self, DohError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DohError::Http {
                provider: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            client_subnet: None,
        })
    }

    /// Send `subnet` as the EDNS client subnet of address queries.
    pub fn with_client_subnet(mut self, subnet: Option<IpNet>) -> Self {
        self.client_subnet = subnet;
        self
    }
}

#[async_trait]
impl DnsTransport for HttpDohTransport {
    async fn query(
        &self,
        provider: &DohProvider,
        name: &str,
        kind: QueryKind,
    ) -> Result<Resolution, DohError> {
        let subnet = match kind {
            QueryKind::A => self.client_subnet.as_ref(),
            QueryKind::Ns => None,
        };
        let body = encode_query(name, kind, subnet)?;
        let http_err = |e: reqwest::Error| DohError::Http {
            provider: provider.name.clone(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(&provider.url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DohError::Status {
                provider: provider.name.clone(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(http_err)?;
        decode_response(&provider.name, &bytes)
    }
}

/// Build the wire-format query for `name`, optionally with an EDNS client
/// subnet option.
pub fn encode_query(
    name: &str,
    kind: QueryKind,
    client_subnet: Option<&IpNet>,
) -> Result<Vec<u8>, DohError> {
    let fqdn = Name::from_ascii(format!("{}.", name.trim_end_matches('.')))
        .map_err(|_| DohError::Encode(name.to_string()))?;

    let mut message = Message::new();
    // RFC 8484 recommends id 0 for cache friendliness
    message.set_id(0);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(fqdn, kind.record_type()));

    if let Some(net) = client_subnet {
        // Address bits past the prefix must be zero
        let net = net.trunc();
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_option(EdnsOption::Subnet(ClientSubnet::new(
            net.addr(),
            net.prefix_len(),
            0,
        )));
        message.set_edns(edns);
    }

    message
        .to_vec()
        .map_err(|_| DohError::Encode(name.to_string()))
}

/// Extract addresses and NS names from a wire-format response.
pub fn decode_response(provider: &str, bytes: &[u8]) -> Result<Resolution, DohError> {
    let message = Message::from_vec(bytes).map_err(|e| DohError::Decode {
        provider: provider.to_string(),
        reason: e.to_string(),
    })?;

    let mut resolution = Resolution::default();
    for record in message.answers() {
        match record.data() {
            Some(RData::A(a)) => resolution.addrs.push(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => resolution.addrs.push(IpAddr::V6(aaaa.0)),
            Some(RData::NS(ns)) => {
                let host = ns.0.to_ascii();
                let host = host.trim_end_matches('.').to_ascii_lowercase();
                if !host.is_empty() && !resolution.names.contains(&host) {
                    resolution.names.push(host);
                }
            }
            // CNAME chains and anything else
            _ => {}
        }
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME, NS};
    use hickory_proto::rr::Record;
    use std::str::FromStr;

    fn response_with(records: Vec<Record>) -> Vec<u8> {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        for record in records {
            message.add_answer(record);
        }
        message.to_vec().unwrap()
    }

    #[test]
    fn test_encode_query() {
        let bytes = encode_query("example.com", QueryKind::Ns, None).unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        let query = &message.queries()[0];
        assert_eq!(query.query_type(), RecordType::NS);
        assert_eq!(query.name().to_ascii(), "example.com.");
        assert!(message.recursion_desired());
        assert!(message.extensions().is_none());
    }

    #[test]
    fn test_encode_client_subnet() {
        let subnet: IpNet = "114.114.114.114/24".parse().unwrap();
        let bytes = encode_query("example.com", QueryKind::A, Some(&subnet)).unwrap();
        let message = Message::from_vec(&bytes).unwrap();

        let edns = message.extensions().as_ref().expect("OPT record");
        assert_eq!(edns.max_payload(), EDNS_PAYLOAD);
        let expected = ClientSubnet::new("114.114.114.0".parse().unwrap(), 24, 0);
        assert_eq!(
            edns.option(hickory_proto::rr::rdata::opt::EdnsCode::Subnet),
            Some(&EdnsOption::Subnet(expected))
        );
    }

    #[test]
    fn test_encode_rejects_bad_name() {
        let long = "a".repeat(70);
        assert!(encode_query(&format!("{}.com", long), QueryKind::A, None).is_err());
    }

    #[test]
    fn test_decode_addresses() {
        let name = Name::from_str("www.example.com.").unwrap();
        let cname_target = Name::from_str("edge.example.net.").unwrap();
        let bytes = response_with(vec![
            Record::from_rdata(name.clone(), 60, RData::CNAME(CNAME(cname_target.clone()))),
            Record::from_rdata(cname_target, 60, RData::A(A::new(1, 0, 1, 1))),
        ]);

        let resolution = decode_response("test", &bytes).unwrap();
        assert_eq!(resolution.addrs, vec!["1.0.1.1".parse::<IpAddr>().unwrap()]);
        assert!(resolution.names.is_empty());
    }

    #[test]
    fn test_decode_ns_names() {
        let name = Name::from_str("example.com.").unwrap();
        let bytes = response_with(vec![
            Record::from_rdata(name.clone(), 60, RData::NS(NS(Name::from_str("F1G1NS1.DNSPOD.NET.").unwrap()))),
            Record::from_rdata(name.clone(), 60, RData::NS(NS(Name::from_str("f1g1ns2.dnspod.net.").unwrap()))),
            Record::from_rdata(name, 60, RData::NS(NS(Name::from_str("f1g1ns2.dnspod.net.").unwrap()))),
        ]);

        let resolution = decode_response("test", &bytes).unwrap();
        assert_eq!(resolution.names, vec!["f1g1ns1.dnspod.net", "f1g1ns2.dnspod.net"]);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_response("broken", b"<html>").unwrap_err();
        assert!(matches!(err, DohError::Decode { .. }));
    }

    #[test]
    fn test_empty_answer() {
        let resolution = decode_response("test", &response_with(Vec::new())).unwrap();
        assert!(resolution.is_empty());
    }
}
