//! `attestgate health` — one-shot readiness probe against a running instance.

pub async fn run(base_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let response = client.get(format!("{base_url}/readyz")).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    println!("{}", serde_json::to_string_pretty(&body)?);

    if status.is_success() {
        Ok(())
    } else {
        Err(format!("instance not ready: {status}").into())
    }
}
