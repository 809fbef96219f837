use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::info;

/// `GET|POST /incoming-call`: the telephony provider's voice webhook.
///
/// Answers with TwiML that connects the call's audio to our `/media-stream`
/// WebSocket. The host is `server.public_host` when set, otherwise the Host
/// header of this request (correct behind most tunnels and proxies).
pub async fn incoming_call(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let host = if config.server.public_host.is_empty() {
        req.connection_info().host().to_string()
    } else {
        config.server.public_host
    };

    info!(host = %host, "Incoming call, connecting media stream");

    HttpResponse::Ok()
        .content_type("application/xml")
        .body(connect_stream_twiml(&host))
}

/// TwiML instructing the provider to stream the call to `wss://{host}/media-stream`.
pub fn connect_stream_twiml(host: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="wss://{}/media-stream"/></Connect></Response>"#,
        escape_attribute(host)
    )
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::header, test as actix_test, App};

    #[test]
    fn test_twiml_shape() {
        let twiml = connect_stream_twiml("relay.example.com");
        assert!(twiml.contains(
            r#"<Response><Connect><Stream url="wss://relay.example.com/media-stream"/></Connect></Response>"#
        ));
        assert!(connect_stream_twiml(r#"a"b"#).contains("wss://a&quot;b/media-stream"));
    }

    #[actix_web::test]
    async fn test_webhook_uses_host_header() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .route("/incoming-call", web::post().to(incoming_call)),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/incoming-call")
            .insert_header((header::HOST, "abc.ngrok.io"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/xml");

        let body = actix_test::read_body(resp).await;
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains("wss://abc.ngrok.io/media-stream"));
    }

    #[actix_web::test]
    async fn test_webhook_prefers_public_host() {
        let mut config = AppConfig::default();
        config.server.public_host = "relay.example.com".to_string();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/incoming-call", web::get().to(incoming_call)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/incoming-call")
            .insert_header((header::HOST, "internal:8080"))
            .to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains("wss://relay.example.com/media-stream"));
    }
}
