use std::time::Duration;

use tracing::debug;

use crate::types::UpdateInfo;

const FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Fetch release metadata from `url`. Any network or parse failure yields
/// None; the caller treats missing metadata as "no update available".
pub async fn fetch_update_info(url: &str) -> Option<UpdateInfo> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .ok()?;
    let resp = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!("update metadata fetch failed: {e}");
            return None;
        }
    };
    resp.json::<UpdateInfo>().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_info_parses_from_json() {
        let raw = r#"{
            "versionCode": 7,
            "downloadUrl": "https://example.com/app.apk",
            "mirrorUrl": "https://mirror.example.com/app.apk",
            "changeLog": "bug fixes"
        }"#;
        let info: UpdateInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.version_code, 7);
        assert_eq!(info.change_log, "bug fixes");
    }

    #[tokio::test]
    async fn fetch_failure_yields_none() {
        assert!(fetch_update_info("http://127.0.0.1:1/update.json")
            .await
            .is_none());
    }
}
