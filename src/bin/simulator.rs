use clap::{App, Arg};
use dronewatch::config::LinkProfile;
use dronewatch::protocol::ProtocolHandler;
use dronewatch::sim::{SimFaultConfig, SimulatedDrone};
use dronewatch::vision::{BlankVideoSource, BoundingBox, Detection, Detector, FixedDetector, NullDetector, ThreatLevel};
use dronewatch::{FlightAgent, ObserverEvent, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: &str = "8080";
const EVENT_BROADCAST_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("dronewatch-sim")
        .version("0.1.0")
        .about("Flight session server backed by a simulated quadcopter")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for observer connections")
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON session configuration"),
        )
        .arg(
            Arg::with_name("profile")
                .long("profile")
                .value_name("PROFILE")
                .possible_values(&["standard", "tolerant"])
                .help("Heartbeat tolerance preset"),
        )
        .arg(
            Arg::with_name("battery")
                .short("b")
                .long("battery")
                .value_name("PERCENT")
                .help("Initial simulated battery level")
                .default_value("85"),
        )
        .arg(
            Arg::with_name("latency")
                .long("latency")
                .value_name("MS")
                .help("Simulated link latency per call")
                .default_value("10"),
        )
        .arg(
            Arg::with_name("faults")
                .long("faults")
                .help("Enable random dropped queries and rejected commands"),
        )
        .arg(
            Arg::with_name("threat-demo")
                .long("threat-demo")
                .help("Report a high-threat detection in every scanned frame"),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let battery: u8 = matches.value_of("battery").unwrap_or("85").parse()?;
    let latency_ms: u64 = matches.value_of("latency").unwrap_or("10").parse()?;

    let mut config = match matches.value_of("config") {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(profile) = matches.value_of("profile") {
        config.apply_profile(profile.parse::<LinkProfile>()?);
    }

    println!("🚁 Dronewatch Flight Simulator");
    println!("==============================");

    let drone = SimulatedDrone::with_battery(battery);
    let control = drone.control();
    control.set_latency(Duration::from_millis(latency_ms)).await;
    if matches.is_present("faults") {
        control
            .set_fault_config(SimFaultConfig { enabled: true, ..SimFaultConfig::default() })
            .await;
        warn!("Probabilistic link faults enabled");
    }

    let detector: Arc<dyn Detector> = if matches.is_present("threat-demo") {
        Arc::new(FixedDetector::new(vec![Detection {
            class: "person".to_string(),
            confidence: 0.91,
            bbox: BoundingBox { x: 280, y: 160, width: 80, height: 200 },
            threat_level: ThreatLevel::High,
        }]))
    } else {
        Arc::new(NullDetector)
    };

    let agent = Arc::new(FlightAgent::new(
        config,
        Box::new(drone),
        Arc::new(BlankVideoSource::new()),
        detector,
    ));
    agent.start().await;

    // Serialize observer events once and fan them out to every client
    let (event_tx, _) = broadcast::channel::<String>(EVENT_BROADCAST_BUFFER_SIZE);
    let event_task = tokio::spawn(forward_events(agent.subscribe(), event_tx.clone()));

    let server_agent = Arc::clone(&agent);
    let server_tx = event_tx.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, server_agent, server_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, landing and releasing the link");

    server.abort();
    agent.shutdown().await;
    event_task.abort();
    println!("🛬 Flight simulator stopped");

    Ok(())
}

async fn forward_events(mut events: broadcast::Receiver<ObserverEvent>, event_tx: broadcast::Sender<String>) {
    let mut protocol = ProtocolHandler::new();
    loop {
        match events.recv().await {
            Ok(event) => match protocol.serialize_event(&event) {
                Ok(json) => {
                    // No clients connected is not an error
                    let _ = event_tx.send(json.to_string());
                }
                Err(e) => warn!("Dropping {} event: {}", event.name(), e),
            },
            Err(RecvError::Lagged(skipped)) => warn!("Event forwarder lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn start_tcp_server(
    port: u16,
    agent: Arc<FlightAgent>,
    event_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("🌐 Observer server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 Observer connected: {}", addr);
                let client_agent = Arc::clone(&agent);
                let client_events = event_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_agent, client_events).await {
                        warn!("Observer {} error: {}", addr, e);
                    }
                    info!("🔌 Observer {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn write_line(writer: &Mutex<OwnedWriteHalf>, line: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_client(
    stream: TcpStream,
    agent: Arc<FlightAgent>,
    mut events: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let event_writer = Arc::clone(&writer);
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = write_line(&event_writer, &event).await {
                        warn!("Failed to push event: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Observer lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim().to_string();
                if trimmed.is_empty() {
                    continue;
                }
                debug!("📨 Received: {}", trimmed);

                // Commands run concurrently so an emergency is never queued behind a long move
                let agent = Arc::clone(&agent);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let response = agent.handle_line(&trimmed).await;
                    if let Err(e) = write_line(&writer, &response).await {
                        warn!("Failed to send response: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    event_task.abort();
    Ok(())
}
