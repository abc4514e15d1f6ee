use std::time::Duration;

use egress::prelude::{CallContext, Client};
use egress::with_standard_retry_policy;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder()
        .client_name("egress-example-retry")
        .option(with_standard_retry_policy(Duration::from_secs(2), 3))
        .metrics_enabled(true)
        .try_build()?;

    let ctx = CallContext::new().timeout(Duration::from_secs(10));
    match client.get(&ctx, "https://postman-echo.com/delay/1", &[]).await {
        Ok(response) => {
            let status = response.status();
            let body = response.into_body().text().await?;
            println!("status={status} body_len={}", body.len());
        }
        Err(error) => println!("request failed code={} error={error}", error.code().as_str()),
    }

    let metrics = client.metrics_snapshot();
    println!(
        "calls={} attempts={} retries={} attempt_timeouts={} avg_latency_ms={:.2}",
        metrics.calls_started,
        metrics.attempts,
        metrics.retries,
        metrics.attempt_timeouts,
        metrics.latency_avg_ms
    );
    println!("error_counts={:?}", metrics.error_counts);

    Ok(())
}
