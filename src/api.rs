use crate::collectors::Pid;
use crate::state::{
    CoreMetrics, GpuProcessMetrics, GpuSystemMetrics, IoRates, MemoryMetrics, ProcessMemory,
    SharedSnapshot, Snapshot,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, trace, warn};

#[derive(Debug, Serialize)]
pub struct CpuDocument<'a> {
    pub num_of_cores: usize,
    pub load: i32,
    pub frequency: i32,
    pub temp: i32,
    pub power: f32,
    pub cores: &'a [CoreMetrics],
}

#[derive(Debug, Serialize)]
pub struct ClientDocument<'a> {
    pub gpu: &'a [GpuProcessMetrics],
    pub memory: &'a ProcessMemory,
    pub io: &'a IoRates,
}

/// Field order is part of the output format.
#[derive(Debug, Serialize)]
pub struct QueryDocument<'a> {
    pub cpu: CpuDocument<'a>,
    pub gpu: &'a [GpuSystemMetrics],
    pub memory: &'a MemoryMetrics,
    pub clients: BTreeMap<Pid, ClientDocument<'a>>,
}

impl<'a> From<&'a Snapshot> for QueryDocument<'a> {
    fn from(snapshot: &'a Snapshot) -> Self {
        Self {
            cpu: CpuDocument {
                num_of_cores: snapshot.cores.len(),
                load: snapshot.cpu.load,
                frequency: snapshot.cpu.frequency,
                temp: snapshot.cpu.temp,
                power: snapshot.cpu.power,
                cores: &snapshot.cores,
            },
            gpu: &snapshot.gpus,
            memory: &snapshot.memory,
            clients: snapshot
                .processes
                .iter()
                .map(|(pid, p)| {
                    let client = ClientDocument {
                        gpu: &p.gpus,
                        memory: &p.memory,
                        io: &p.io,
                    };
                    (*pid, client)
                })
                .collect(),
        }
    }
}

pub fn render_document(snapshot: &Snapshot) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    QueryDocument::from(snapshot).serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub async fn serve(
    listener: TcpListener,
    shared: SharedSnapshot,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, "query api listening");
    }
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("query api received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(peer = %peer, "query api connection");
                    connections.spawn(respond(stream, shared.clone()));
                }
                Err(err) => warn!(error = %err, "failed to accept query api connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "query api task failed");
                }
            }
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn respond(mut stream: TcpStream, shared: SharedSnapshot) {
    let snapshot = shared.load().await;
    let mut body = match render_document(&snapshot) {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "failed to serialize snapshot");
            return;
        }
    };
    body.push('\n');

    if let Err(err) = stream.write_all(body.as_bytes()).await {
        warn!(error = %err, "failed to write query api response");
        return;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CpuMetrics, ProcessMetrics};
    use tokio::io::AsyncReadExt;

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot {
            cpu: CpuMetrics {
                load: 12,
                frequency: 3600,
                temp: 49,
                power: 20.0,
            },
            cores: vec![CoreMetrics {
                load: 12,
                frequency: 3600,
            }],
            gpus: vec![GpuSystemMetrics {
                load: 5,
                ..GpuSystemMetrics::default()
            }],
            ..Snapshot::default()
        };
        for pid in [100, 99] {
            snapshot.processes.insert(
                pid,
                ProcessMetrics {
                    gpus: vec![GpuProcessMetrics::default()],
                    ..ProcessMetrics::default()
                },
            );
        }
        snapshot
    }

    #[test]
    fn document_sections_in_order() {
        let text = render_document(&snapshot()).unwrap();
        let cpu = text.find("\"cpu\"").unwrap();
        let gpu = text.find("\"gpu\"").unwrap();
        let memory = text.find("\"memory\"").unwrap();
        let clients = text.find("\"clients\"").unwrap();
        assert!(cpu < gpu && gpu < memory && memory < clients);
        assert!(text.starts_with("{\n    \"cpu\": {\n        \"num_of_cores\": 1"));
        assert!(text.find("\"99\"").unwrap() < text.find("\"100\"").unwrap());
    }

    #[test]
    fn document_fields() {
        let text = render_document(&snapshot()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["cpu"]["cores"][0]["frequency"], 3600);
        assert_eq!(value["gpu"][0]["load"], 5);
        assert_eq!(value["gpu"][0]["is_apu"], false);
        assert_eq!(value["memory"]["swap_used"], 0.0);
        assert_eq!(value["clients"]["100"]["io"]["read_mb_per_sec"], 0.0);
        assert_eq!(value["clients"]["99"]["memory"]["virt"], 0.0);
        assert_eq!(value["clients"]["99"]["gpu"][0]["vram_used"], 0.0);
    }

    #[tokio::test]
    async fn one_document_per_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, SharedSnapshot::new(snapshot()), shutdown_rx));

        for _ in 0..2 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut text = String::new();
            stream.read_to_string(&mut text).await.unwrap();
            assert!(text.ends_with("}\n"));
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["cpu"]["load"], 12);
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
