use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use pulsedesk_sdk::realtime::client::RealtimeClient;
use pulsedesk_sdk::realtime::proto::WILDCARD;
use pulsedesk_sdk::session_api::SessionApiClient;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let token = "REPLACE_WITH_API_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = Arc::new(
            SessionApiClient::with_token(SecretString::new(token.clone()))?.with_local_mode(true),
        );
        let client = RealtimeClient::new()
            .with_endpoint("ws://localhost:6001")
            .with_token(SecretString::new(token));

        let handle = client.start(session);

        handle.subscribe("quote.updated", |envelope| {
            println!("quote updated: {}", envelope.data);
        });
        handle.subscribe(WILDCARD, |envelope| {
            println!(
                "event={} tenant={} at={}",
                envelope.event,
                envelope.tenant_id.as_deref().unwrap_or("-"),
                envelope.timestamp.as_deref().unwrap_or("-"),
            );
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        println!("closing (connected={})", handle.is_connected());
        handle.close().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
