// =============================================================================
// gateway.rs — THE PORTAL AIRLOCK
// =============================================================================
//
// Everything the engine knows about the court records portal fits in one
// trait method: give me a case number and a source, get back a snapshot.
// The portal's login forms, session cookies, and HTML indigestion all live
// behind this seam, which means the other 90% of the engine can be tested
// without ever summoning a government web server.
//
// The bundled HTTP implementation speaks the portal's XML docket feed.
// The structure looks like:
//
// <docket case="2:24-cv-01337">
//   <case-info>
//     <judge>Hon. A. Example</judge>
//     <status>Open</status>
//     <court>D. Example</court>
//     <party>Smith</party>
//     <party>MegaCorp Inc.</party>
//   </case-info>
//   <entry>
//     <number>3</number>
//     <description><![CDATA[MOTION to Dismiss filed by MegaCorp Inc.]]></description>
//     <filed>2024-01-15</filed>
//     <document>https://portal/doc/3/1</document>
//   </entry>
//   <billed>30</billed>
// </docket>
//
// We parse this with hand-rolled tag extraction instead of a full XML
// parser because the feed is simple enough that string scanning works
// perfectly fine. Is this best practice? No. Does it work? Yes. Will it
// break if the portal changes its format? Probably. Have they changed it
// since anyone can remember? Also no.
// =============================================================================

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::MonitorError;
use crate::models::{CaseInfo, DocketEntry, Snapshot};

/// The one seam between this engine and the outside world.
#[async_trait]
pub trait RecordsGateway: Send + Sync {
    /// Fetch a fresh snapshot of a case's docket. The returned
    /// `cost_cents` is what the portal actually billed for the fetch —
    /// admission control estimated beforehand, this settles the tab.
    async fn fetch_snapshot(
        &self,
        case_number: &str,
        source_id: &str,
    ) -> Result<Snapshot, MonitorError>;
}

/// The production gateway: HTTPS to the portal's docket feed.
pub struct HttpRecordsGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordsGateway {
    /// Build the gateway with a bounded-timeout client and an honest
    /// user agent, because portal administrators have enough problems
    /// without wondering who's scraping their feeds.
    pub fn new(config: &Config) -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .timeout(config.portal_http_timeout)
            .user_agent(config.portal_user_agent.clone())
            .build()
            .map_err(|e| MonitorError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.portal_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RecordsGateway for HttpRecordsGateway {
    async fn fetch_snapshot(
        &self,
        case_number: &str,
        source_id: &str,
    ) -> Result<Snapshot, MonitorError> {
        let url = format!(
            "{}/docket?case={}&source={}",
            self.base_url,
            urlencoding::encode(case_number),
            urlencoding::encode(source_id),
        );
        debug!(url = %url, "Fetching docket snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MonitorError::gateway(case_number, source_id, e.to_string()))?;

        // 429 is the portal's way of saying "you again?" — surface it as a
        // rate limit (a deferral), not a gateway failure (a retry burner).
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(MonitorError::RateLimit {
                source_id: source_id.to_string(),
                retry_after,
            });
        }

        if !response.status().is_success() {
            return Err(MonitorError::gateway(
                case_number,
                source_id,
                format!("portal returned HTTP {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MonitorError::gateway(case_number, source_id, e.to_string()))?;

        Ok(parse_docket_feed(&body))
    }
}

/// Parse the portal's XML docket feed into a Snapshot.
pub fn parse_docket_feed(xml: &str) -> Snapshot {
    let mut entries = Vec::new();
    for entry_xml in extract_blocks(xml, "entry") {
        let number: u32 = extract_xml_tag(&entry_xml, "number")
            .parse()
            .unwrap_or_default();
        let description = extract_xml_tag(&entry_xml, "description");
        let filed_date = parse_feed_date(&extract_xml_tag(&entry_xml, "filed"));
        let document_links = extract_all_tags(&entry_xml, "document");
        entries.push(DocketEntry {
            entry_number: number,
            description,
            filed_date,
            document_links,
        });
    }

    let case_info = match extract_blocks(xml, "case-info").into_iter().next() {
        Some(info_xml) => CaseInfo {
            judge: non_empty(extract_xml_tag(&info_xml, "judge")),
            status: non_empty(extract_xml_tag(&info_xml, "status")),
            parties: extract_all_tags(&info_xml, "party"),
            court: non_empty(extract_xml_tag(&info_xml, "court")),
        },
        None => CaseInfo::default(),
    };

    // The portal tells us what it billed in a <billed> tag. Absent tag
    // means a free fetch, which happens exactly as often as you'd expect
    // from a fee-funded portal: rarely, but gloriously.
    let cost_cents = extract_xml_tag(xml, "billed").parse().unwrap_or(0);

    Snapshot {
        entries,
        case_info,
        cost_cents,
        fetched_at: Utc::now(),
    }
}

/// Extract every `<tag>...</tag>` block (including nesting-free interiors)
/// from the XML, in document order.
fn extract_blocks(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut remaining = xml;

    while let Some(start) = remaining.find(&open) {
        if let Some(end) = remaining[start..].find(&close) {
            let block = &remaining[start..start + end + close.len()];
            blocks.push(block.to_string());
            remaining = &remaining[start + end + close.len()..];
        } else {
            break;
        }
    }
    blocks
}

/// Extract the text content of the first `<tag>` in the XML, handling the
/// CDATA burritos the portal likes to wrap descriptions in.
fn extract_xml_tag(xml: &str, tag: &str) -> String {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    if let Some(start) = xml.find(&open) {
        if let Some(end) = xml[start..].find(&close) {
            let content = &xml[start + open.len()..start + end];
            return content
                .replace("<![CDATA[", "")
                .replace("]]>", "")
                .trim()
                .to_string();
        }
    }
    String::new()
}

/// Extract the text of every `<tag>` occurrence, in order.
fn extract_all_tags(xml: &str, tag: &str) -> Vec<String> {
    extract_blocks(xml, tag)
        .iter()
        .map(|block| extract_xml_tag(block, tag))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse the feed's date spellings. Courts use "2024-01-15" on good days
/// and "01/15/2024" on the rest; we accept both and shrug at anything else.
fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// A fully scripted gateway for tests: responses are queued up front and
/// handed out in order. Supports hanging forever (for timeout tests) and
/// counts fetches (for "the in-flight check completed" assertions).
#[cfg(test)]
pub struct ScriptedGateway {
    responses: parking_lot::Mutex<std::collections::VecDeque<ScriptedResponse>>,
    fallback: parking_lot::Mutex<Option<Snapshot>>,
    pub fetch_count: portable_atomic::AtomicU64,
}

#[cfg(test)]
pub enum ScriptedResponse {
    Ok(Snapshot),
    Err(String),
    RateLimited,
    /// Never resolves. The check timeout had better be watching.
    Hang,
}

#[cfg(test)]
impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            responses: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            fallback: parking_lot::Mutex::new(None),
            fetch_count: portable_atomic::AtomicU64::new(0),
        }
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    /// When the scripted queue runs dry, serve this snapshot forever.
    pub fn set_fallback(&self, snapshot: Snapshot) {
        *self.fallback.lock() = Some(snapshot);
    }
}

#[cfg(test)]
#[async_trait]
impl RecordsGateway for ScriptedGateway {
    async fn fetch_snapshot(
        &self,
        case_number: &str,
        source_id: &str,
    ) -> Result<Snapshot, MonitorError> {
        self.fetch_count
            .fetch_add(1, portable_atomic::Ordering::Relaxed);
        let next = self.responses.lock().pop_front();
        match next {
            Some(ScriptedResponse::Ok(snapshot)) => Ok(snapshot),
            Some(ScriptedResponse::Err(reason)) => {
                Err(MonitorError::gateway(case_number, source_id, reason))
            }
            Some(ScriptedResponse::RateLimited) => Err(MonitorError::RateLimit {
                source_id: source_id.to_string(),
                retry_after: None,
            }),
            Some(ScriptedResponse::Hang) => {
                // Sleep well past any test timeout; cancellation or the
                // check timeout is expected to fire first.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(MonitorError::gateway(case_number, source_id, "unreachable"))
            }
            None => match self.fallback.lock().clone() {
                Some(snapshot) => Ok(snapshot),
                None => Err(MonitorError::gateway(
                    case_number,
                    source_id,
                    "scripted gateway exhausted",
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"
        <docket case="2:24-cv-01337">
          <case-info>
            <judge>Hon. A. Example</judge>
            <status>Open</status>
            <court>D. Example</court>
            <party>Smith</party>
            <party>MegaCorp Inc.</party>
          </case-info>
          <entry>
            <number>1</number>
            <description><![CDATA[COMPLAINT filed by Smith]]></description>
            <filed>2024-01-02</filed>
            <document>https://portal/doc/1/1</document>
          </entry>
          <entry>
            <number>3</number>
            <description>MOTION to Dismiss filed by MegaCorp Inc.</description>
            <filed>01/15/2024</filed>
            <document>https://portal/doc/3/1</document>
            <document>https://portal/doc/3/2</document>
          </entry>
          <billed>30</billed>
        </docket>
    "#;

    #[test]
    fn test_parse_docket_feed() {
        let snapshot = parse_docket_feed(FEED);

        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].entry_number, 1);
        assert_eq!(snapshot.entries[0].description, "COMPLAINT filed by Smith");
        assert_eq!(
            snapshot.entries[0].filed_date,
            NaiveDate::from_ymd_opt(2024, 1, 2)
        );
        assert_eq!(snapshot.entries[1].document_links.len(), 2);
        // Both date spellings parse.
        assert_eq!(
            snapshot.entries[1].filed_date,
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );

        assert_eq!(snapshot.case_info.judge.as_deref(), Some("Hon. A. Example"));
        assert_eq!(snapshot.case_info.parties.len(), 2);
        assert_eq!(snapshot.cost_cents, 30);
    }

    #[test]
    fn test_parse_empty_feed() {
        let snapshot = parse_docket_feed("<docket></docket>");
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.case_info, CaseInfo::default());
        assert_eq!(snapshot.cost_cents, 0);
    }

    #[tokio::test]
    async fn test_scripted_gateway_plays_in_order() {
        let gateway = ScriptedGateway::new();
        gateway.push(ScriptedResponse::Ok(parse_docket_feed(FEED)));
        gateway.push(ScriptedResponse::Err("portal down".into()));

        assert!(gateway.fetch_snapshot("2:24-cv-01337", "pacer").await.is_ok());
        assert!(gateway.fetch_snapshot("2:24-cv-01337", "pacer").await.is_err());
        assert_eq!(
            gateway.fetch_count.load(portable_atomic::Ordering::Relaxed),
            2
        );
    }
}
