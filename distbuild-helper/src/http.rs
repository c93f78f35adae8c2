//! HTTP fetch on behalf of the controller (`http-request` / `http-response`,
//! `spec.md` §6). The controller itself never speaks HTTP; this is the
//! one place in the system that does, since only a colocated helper
//! process is trusted with outbound network access.

use distbuild_core::Message;
use serde_json::Value;

pub async fn run_http_request(
    client: &reqwest::Client,
    id: String,
    url: String,
    method: String,
    headers: Option<Value>,
    body: Option<String>,
) -> Message {
    let result = dispatch(client, &url, &method, headers, body).await;
    match result {
        Ok((status, headers, body)) => Message::HttpResponse {
            id,
            status,
            headers,
            body,
        },
        Err(err) => Message::HttpResponse {
            id,
            status: 0,
            headers: Value::Null,
            body: format!("helper: http request failed: {err}"),
        },
    }
}

async fn dispatch(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    headers: Option<Value>,
    body: Option<String>,
) -> anyhow::Result<(u16, Value, String)> {
    let method = method.parse::<reqwest::Method>()?;
    let mut builder = client.request(method, url);

    if let Some(Value::Object(map)) = headers {
        for (k, v) in map {
            if let Some(v) = v.as_str() {
                builder = builder.header(k, v);
            }
        }
    }
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let resp_headers: Value = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
        .collect::<serde_json::Map<_, _>>()
        .into();
    let text = response.text().await?;
    Ok((status, resp_headers, text))
}
