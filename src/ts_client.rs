use crate::config::TsConfig;
use crate::formatter::TicketDetails;
use crate::utils::errors::RelayError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Given a ticket id, returns ticket detail fields (§4.B). A capability
/// trait so the Processor and tests can swap in a fake implementation
/// without touching the TS over the network.
#[async_trait]
pub trait TicketInfoClient: Send + Sync {
    async fn get(&self, ticket_id: i64) -> Result<TicketDetails, RelayError>;
}

/// One element of the TS's `TicketGet` response array. Field names mirror
/// the wire format exactly; everything the Formatter and Processor need
/// from a ticket lives here.
#[derive(Debug, Deserialize)]
struct TicketGetEntry {
    #[serde(rename = "TicketNumber")]
    ticket_number: String,
    #[serde(rename = "Type")]
    r#type: String,
    #[serde(rename = "CustomerID")]
    customer_id: String,
    #[serde(rename = "Created")]
    created: String,
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "Lock")]
    lock: String,
    #[serde(rename = "StateType")]
    state_type: String,
}

#[derive(Debug, Deserialize)]
struct TicketGetResponse {
    #[serde(rename = "Ticket")]
    ticket: Vec<TicketGetEntry>,
}

/// HTTP-backed `TicketInfoClient` hitting the TS's generic-interface REST
/// connector.
pub struct HttpTicketInfoClient {
    http: reqwest::Client,
    host: String,
    ticket_url_prefix: String,
    protocol: String,
    port: String,
    login: String,
    password: String,
    get_ticket_detail_path: String,
}

impl HttpTicketInfoClient {
    pub fn new(ts: &TsConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(ts.api.insecure_connection)
            .build()
            .map_err(RelayError::Http)?;

        Ok(Self {
            http,
            host: ts.host.clone(),
            ticket_url_prefix: ts.ticket_url_prefix.clone(),
            protocol: ts.api.protocol.clone(),
            port: ts.api.port.clone(),
            login: ts.api.login.clone(),
            password: ts.api.password.clone(),
            get_ticket_detail_path: ts.api.get_ticket_detail_path.clone(),
        })
    }

    fn request_url(&self, ticket_id: i64) -> String {
        format!(
            "{}://{}:{}{}/{}?UserLogin={}&Password={}",
            self.protocol,
            self.host,
            self.port,
            self.get_ticket_detail_path,
            ticket_id,
            self.login,
            self.password,
        )
    }
}

#[async_trait]
impl TicketInfoClient for HttpTicketInfoClient {
    #[instrument(skip(self), fields(ticket_id))]
    async fn get(&self, ticket_id: i64) -> Result<TicketDetails, RelayError> {
        let url = self.request_url(ticket_id);
        debug!(url = %url, "fetching ticket detail");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("TS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(RelayError::Transient(format!(
                "TS returned status {}",
                response.status()
            )));
        }

        let body: TicketGetResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transient(format!("TS response not valid JSON: {e}")))?;

        let entry = body.ticket.into_iter().next().ok_or_else(|| {
            warn!(ticket_id, "TS returned an empty ticket array");
            RelayError::Transient(format!("no ticket detail returned for {ticket_id}"))
        })?;

        Ok(TicketDetails {
            ticket_number: entry.ticket_number,
            r#type: entry.r#type,
            customer_id: entry.customer_id,
            title: entry.title,
            lock: entry.lock,
            state_type: entry.state_type,
            created: entry.created,
            url: format!("{}{}", self.ticket_url_prefix, ticket_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsApiConfig;

    fn ts_config() -> TsConfig {
        TsConfig {
            host: "ts.example.com".to_string(),
            ticket_url_prefix: "https://ts.example.com/ticket/".to_string(),
            api: TsApiConfig {
                login: "api-user".to_string(),
                password: "secret".to_string(),
                protocol: "https".to_string(),
                port: "443".to_string(),
                insecure_connection: false,
                get_ticket_detail_path: "/otrs/nph-genericinterface.pl/Webservice/GenericTicketConnectorREST/TicketGet".to_string(),
            },
        }
    }

    #[test]
    fn request_url_embeds_ticket_id_and_credentials() {
        let client = HttpTicketInfoClient::new(&ts_config()).unwrap();
        let url = client.request_url(4242);
        assert!(url.contains("/TicketGet/4242"));
        assert!(url.contains("UserLogin=api-user"));
        assert!(url.contains("Password=secret"));
    }
}
