use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// No overall timeout: streamed Gemini answers can run for minutes. Callers set
// per-request timeouts instead.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
