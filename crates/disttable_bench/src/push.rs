//! Publishing to a Prometheus push gateway, grouped by run so that every run
//! shows up separately on the benchmark dashboard.
use anyhow::Context;
use metrics::gather_text;
use reqwest::{
    header::CONTENT_TYPE,
    Url,
};

pub const JOB: &str = "insert";
const DASHBOARD: &str = "b3a7d255-4083-4a5a-80be-da20613ccd60/postgresql-benchmark-load";
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// `<gateway>/metrics/job/insert/run_ts/<run_ts>[/<label>/<value>...]`
pub fn push_url(gateway: &Url, run_ts: &str, grouping: &[(String, String)]) -> anyhow::Result<Url> {
    let mut url = gateway.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("push gateway url {gateway} cannot be a base"))?
        .pop_if_empty()
        .extend(["metrics", "job", JOB, "run_ts", run_ts])
        .extend(
            grouping
                .iter()
                .flat_map(|(key, value)| [key.as_str(), value.as_str()]),
        );
    Ok(url)
}

/// Replaces the metrics of the run's group with everything registered in
/// this process.
pub async fn push_metrics(client: &reqwest::Client, url: Url) -> anyhow::Result<()> {
    let body = gather_text()?;
    client
        .put(url.clone())
        .header(CONTENT_TYPE, TEXT_FORMAT)
        .body(body)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("fail to push metrics to gateway {url}"))?;
    Ok(())
}

pub fn dashboard_url(grafana: &Url, run_ts: &str) -> anyhow::Result<Url> {
    let mut url = grafana.join(&format!("d/{DASHBOARD}"))?;
    url.query_pairs_mut()
        .append_pair("orgId", "1")
        .append_pair("var-job", JOB)
        .append_pair("var-run_ts", run_ts);
    Ok(url)
}
