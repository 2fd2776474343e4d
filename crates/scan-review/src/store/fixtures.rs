use chrono::{DateTime, TimeZone, Utc};

use super::Store;
use crate::models::{NewHost, NewPlugin, NewScan, Severity};

pub(crate) type PluginRow<'a> = (i64, &'a str, Severity, &'a [&'a str]);

pub(crate) fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, 9, 0, 0).unwrap()
}

/// Creates a scan holding one finding per plugin row, each linked to the listed hosts.
pub(crate) async fn seed_scan(
    store: &Store,
    name: &str,
    created_at: DateTime<Utc>,
    plugins: &[PluginRow<'_>],
) -> i64 {
    let scan_id = store
        .insert_scan(&NewScan {
            scan_name: name.to_string(),
            created_at,
        })
        .await
        .unwrap();

    for (plugin_id, plugin_name, severity, hosts) in plugins {
        store
            .upsert_plugin(&NewPlugin {
                plugin_id: *plugin_id,
                plugin_name: plugin_name.to_string(),
                severity: *severity,
                cves: Vec::new(),
                metasploit_names: Vec::new(),
            })
            .await
            .unwrap();
        let finding_id = store.insert_finding(scan_id, *plugin_id).await.unwrap();
        for ip in *hosts {
            let host_id = store
                .upsert_host(&NewHost {
                    ip_address: ip.to_string(),
                    hostname: None,
                    scan_target_type: Some("ipv4".to_string()),
                    seen_at: created_at,
                })
                .await
                .unwrap();
            store.link_host(finding_id, host_id, None).await.unwrap();
        }
    }

    scan_id
}

pub(crate) async fn finding_id(store: &Store, scan_id: i64, plugin_id: i64) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT finding_id FROM findings WHERE scan_id = ? AND plugin_id = ?")
        .bind(scan_id)
        .bind(plugin_id)
        .fetch_one(store.pool())
        .await
        .unwrap()
}
