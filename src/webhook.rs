use crate::processor::EventProcessor;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use warp::{http::StatusCode, reply::Response, Filter, Reply};

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct NewTicketForm {
    id: String,
}

/// `POST /newticket` (§4.H). The only inbound trigger besides the timer.
pub async fn serve(bind_addr: SocketAddr, processor: Arc<EventProcessor>, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
    let route = warp::path("newticket")
        .and(warp::post())
        .and(warp::body::form())
        .and(with_processor(processor))
        .and_then(handle_new_ticket);

    let (_, server) = warp::serve(route).bind_with_graceful_shutdown(bind_addr, async move {
        shutdown.await;
        info!("webhook listener received shutdown signal, draining for {:?}", GRACEFUL_SHUTDOWN);
        tokio::time::sleep(GRACEFUL_SHUTDOWN).await;
    });

    info!(%bind_addr, "webhook server listening");
    server.await;
    info!("webhook server stopped");
}

fn with_processor(
    processor: Arc<EventProcessor>,
) -> impl Filter<Extract = (Arc<EventProcessor>,), Error = Infallible> + Clone {
    warp::any().map(move || processor.clone())
}

async fn handle_new_ticket(form: NewTicketForm, processor: Arc<EventProcessor>) -> Result<Response, Infallible> {
    let raw_id = form.id.clone();

    let ticket_id: i64 = match raw_id.parse() {
        Ok(id) => id,
        Err(_) => {
            warn!(raw_id, "webhook received non-numeric ticket id");
            return Ok(respond(StatusCode::BAD_REQUEST, false, "Invalid id field content", &raw_id));
        }
    };

    match processor.create_event(ticket_id).await {
        Ok(_created_or_already_exists) => {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process_one().await });
            Ok(respond(StatusCode::OK, true, "", &raw_id))
        }
        Err(e) => {
            error!(ticket_id, "failed to record event from webhook: {e}");
            Ok(respond(StatusCode::OK, true, "", &raw_id))
        }
    }
}

fn respond(status: StatusCode, success: bool, error_message: &str, raw_id: &str) -> Response {
    let body = json!({ "TicketID": raw_id });
    let mut response = warp::reply::json(&body).into_response();
    *response.status_mut() = status;
    response.headers_mut().insert(
        "ResponseSuccess",
        if success { "1" } else { "0" }.parse().unwrap(),
    );
    response
        .headers_mut()
        .insert("ResponseErrorMessage", error_message.parse().unwrap());
    response
}
