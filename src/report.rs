//! Append-only telemetry report writer: one task owns the file, every
//! producer sends rows over a bounded channel and drops them if the
//! writer falls behind. Single writer, no locking.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::digest::Protocol;

/// Bound on the report queue; a slow disk drops rows rather than stalling
/// the digest-processing path.
pub const REPORT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub switch: String,
    pub tunnel_id: u64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    #[serde(serialize_with = "serialize_protocol")]
    pub protocol: Protocol,
    pub sending_rate: f64,
    pub throughput: f64,
    pub overhead_ns: u64,
    pub is_malicious: bool,
}

fn serialize_protocol<S: serde::Serializer>(p: &Protocol, s: S) -> Result<S::Ok, S::Error> {
    match p {
        Protocol::Tcp => s.serialize_str("tcp"),
        Protocol::Udp => s.serialize_str("udp"),
        Protocol::Other(n) => s.serialize_u8(*n),
    }
}

/// Spawn the report-writer task. Returns the sender producers push rows
/// into; the task exits once every sender has been dropped.
pub fn spawn_report_writer(path: PathBuf) -> mpsc::Sender<ReportRow> {
    let (tx, mut rx) = mpsc::channel::<ReportRow>(REPORT_QUEUE_CAPACITY);

    tokio::spawn(async move {
        let file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open report file, telemetry rows will be dropped");
                while rx.recv().await.is_some() {}
                return;
            }
        };
        let mut file = file;

        while let Some(row) = rx.recv().await {
            match serde_json::to_string(&row) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(error = %e, "failed to append report row");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize report row"),
            }
        }
    });

    tx
}

pub async fn read_report_rows(path: &Path) -> std::io::Result<Vec<ReportRow>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_appends_newline_delimited_json_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let tx = spawn_report_writer(path.clone());

        for i in 0..3u64 {
            tx.send(ReportRow {
                switch: "s1".into(),
                tunnel_id: i,
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                src_port: 1000,
                dst_port: 2000,
                protocol: Protocol::Tcp,
                sending_rate: 1.0,
                throughput: 2.0,
                overhead_ns: 10,
                is_malicious: false,
            })
            .await
            .unwrap();
        }
        drop(tx);

        // Give the writer task a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let rows = read_report_rows(&path).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].switch, "s1");
    }
}
