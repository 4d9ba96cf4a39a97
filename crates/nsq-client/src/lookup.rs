use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConsumerError;

const NSQ_ACCEPT_HEADER: &str = "application/vnd.nsq; version=1.0";

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Thin `GET {endpoint}/lookup?topic={topic}` client. Every failure —
/// transport, non-2xx status, or malformed JSON — collapses to a single
/// [`ConsumerError::Lookup`], so a bad lookupd never crashes the poller, it
/// just fails one iteration.
pub(crate) struct LookupClient {
    http: reqwest::Client,
}

impl LookupClient {
    pub fn new(request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client config is valid");
        Self { http }
    }

    pub async fn query_producers(
        &self,
        endpoint: &str,
        topic: &str,
    ) -> Result<Vec<SocketAddr>, ConsumerError> {
        let url = format!("{}/lookup", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("topic", topic)])
            .header(reqwest::header::ACCEPT, NSQ_ACCEPT_HEADER)
            .send()
            .await
            .map_err(|err| ConsumerError::Lookup { endpoint: endpoint.to_string(), reason: err.to_string() })?;

        if !response.status().is_success() {
            return Err(ConsumerError::Lookup {
                endpoint: endpoint.to_string(),
                reason: format!("lookupd returned {}", response.status()),
            });
        }

        let body: LookupResponse = response.json().await.map_err(|err| ConsumerError::Lookup {
            endpoint: endpoint.to_string(),
            reason: format!("failed to parse lookupd response: {err}"),
        })?;

        let mut addrs = Vec::with_capacity(body.producers.len());
        for producer in body.producers {
            match resolve_producer(&producer) {
                Some(addr) => addrs.push(addr),
                None => {
                    tracing::warn!(
                        "ignoring producer with unresolvable address: endpoint={endpoint}, broadcast_address={}",
                        producer.broadcast_address
                    );
                }
            }
        }
        Ok(addrs)
    }
}

fn resolve_producer(producer: &Producer) -> Option<SocketAddr> {
    format!("{}:{}", producer.broadcast_address, producer.tcp_port).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_producer_list() {
        let json = br#"{"producers":[{"broadcast_address":"10.0.0.1","tcp_port":4150}]}"#;
        let parsed: LookupResponse = serde_json::from_slice(json).unwrap();
        assert_eq!(parsed.producers.len(), 1);
        assert_eq!(parsed.producers[0].tcp_port, 4150);
    }

    #[test]
    fn resolves_producer_to_socket_addr() {
        let producer = Producer { broadcast_address: "127.0.0.1".to_string(), tcp_port: 4150 };
        assert_eq!(resolve_producer(&producer), Some("127.0.0.1:4150".parse().unwrap()));
    }

    #[test]
    fn empty_producer_list_parses() {
        let json = br#"{"producers":[]}"#;
        let parsed: LookupResponse = serde_json::from_slice(json).unwrap();
        assert!(parsed.producers.is_empty());
    }
}
