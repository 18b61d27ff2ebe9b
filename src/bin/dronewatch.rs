use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use dronewatch::patrol::PatrolKind;
use dronewatch::protocol::current_timestamp_ms;
use dronewatch::transport::{MoveDirection, RotateDirection};
use dronewatch::{Command, CommandType};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
// Covers the connect handshake and a full command timeout
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("dronewatch")
        .version("0.1.0")
        .about("🚁 Dronewatch - perimeter patrol control for a small quadcopter")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Flight server host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Flight server port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("connect").about("🔗 Open the link to the aircraft"))
        .subcommand(SubCommand::with_name("takeoff").about("🛫 Take off"))
        .subcommand(SubCommand::with_name("land").about("🛬 Land"))
        .subcommand(SubCommand::with_name("emergency").about("🛑 Stop all motors immediately"))
        .subcommand(
            SubCommand::with_name("move")
                .about("↕️  Move relative to the current position")
                .arg(
                    Arg::with_name("direction")
                        .required(true)
                        .possible_values(&["up", "down", "left", "right", "forward", "back"]),
                )
                .arg(Arg::with_name("distance").help("Distance in centimeters").required(true)),
        )
        .subcommand(
            SubCommand::with_name("rotate")
                .about("🔄 Rotate in place")
                .arg(Arg::with_name("direction").required(true).possible_values(&["cw", "ccw"]))
                .arg(Arg::with_name("degrees").required(true)),
        )
        .subcommand(SubCommand::with_name("status").about("📊 Get flight, link and patrol status"))
        .subcommand(
            SubCommand::with_name("patrol")
                .about("🗺️  Autonomous patrol control")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("start")
                        .about("Start a patrol run")
                        .arg(
                            Arg::with_name("kind")
                                .help("clockwise, counterclockwise, random or specific:<corner>")
                                .default_value("clockwise"),
                        ),
                )
                .subcommand(SubCommand::with_name("stop").about("Stop the active run and return home"))
                .subcommand(
                    SubCommand::with_name("history")
                        .about("Show completed runs")
                        .arg(
                            Arg::with_name("limit")
                                .short("n")
                                .long("limit")
                                .takes_value(true)
                                .default_value("20"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("params")
                        .about("Set patrol height and side length in meters")
                        .arg(Arg::with_name("height").required(true))
                        .arg(Arg::with_name("side").required(true)),
                )
                .subcommand(SubCommand::with_name("reset").about("Clear an error state and re-home")),
        )
        .subcommand(SubCommand::with_name("monitor").about("📺 Stream observer events"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");

    if let ("monitor", _) = matches.subcommand() {
        return monitor(host, port, format).await;
    }

    let (action, command_type) = build_command(&matches)?;
    let response = send_command(host, port, command_type).await?;
    print_response(action, &response, format);
    Ok(())
}

fn build_command(matches: &ArgMatches<'_>) -> Result<(&'static str, CommandType), Box<dyn std::error::Error>> {
    let command = match matches.subcommand() {
        ("connect", _) => ("connect", CommandType::Connect),
        ("takeoff", _) => ("takeoff", CommandType::Takeoff),
        ("land", _) => ("land", CommandType::Land),
        ("emergency", _) => ("emergency", CommandType::Emergency),
        ("move", Some(sub)) => {
            let direction: MoveDirection = sub.value_of("direction").unwrap_or_default().parse()?;
            let distance = sub.value_of("distance").unwrap_or_default().parse::<u32>()?;
            ("move", CommandType::Move { direction, distance })
        }
        ("rotate", Some(sub)) => {
            let direction: RotateDirection = sub.value_of("direction").unwrap_or_default().parse()?;
            let degrees = sub.value_of("degrees").unwrap_or_default().parse::<u32>()?;
            ("rotate", CommandType::Rotate { direction, degrees })
        }
        ("status", _) => ("status", CommandType::GetStatus),
        ("patrol", Some(sub)) => match sub.subcommand() {
            ("start", Some(start)) => {
                let patrol_type: PatrolKind = start.value_of("kind").unwrap_or("clockwise").parse()?;
                ("start patrol", CommandType::StartPatrol { patrol_type })
            }
            ("stop", _) => ("stop patrol", CommandType::StopPatrol),
            ("history", Some(history)) => {
                let limit = history.value_of("limit").unwrap_or("20").parse::<usize>()?;
                ("patrol history", CommandType::GetPatrolHistory { limit: Some(limit) })
            }
            ("params", Some(params)) => {
                let height = params.value_of("height").unwrap_or_default().parse::<f32>()?;
                let side_length = params.value_of("side").unwrap_or_default().parse::<f32>()?;
                ("patrol parameters", CommandType::SetPatrolParameters { height, side_length })
            }
            ("reset", _) => ("reset patrol", CommandType::ResetPatrol),
            (other, _) => return Err(format!("unknown patrol command '{}'", other).into()),
        },
        (other, _) => return Err(format!("unknown command '{}'", other).into()),
    };
    Ok(command)
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to reach flight server at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "dronewatch-sim".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

/// Send one command and wait for its response, skipping pushed events.
async fn send_command(host: &str, port: u16, command_type: CommandType) -> Result<Value, Box<dyn std::error::Error>> {
    let timestamp = current_timestamp_ms();
    let command = Command {
        id: ((timestamp % u64::from(u32::MAX)) as u32).max(1),
        timestamp,
        command_type,
    };
    let id = command.id;

    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(serde_json::to_string(&command)?.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let wait = async {
        while let Some(line) = lines.next_line().await? {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if value.get("event").is_none() && value["id"].as_u64() == Some(u64::from(id)) {
                return Ok::<Value, std::io::Error>(value);
            }
        }
        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "server closed connection"))
    };

    match tokio::time::timeout(RESPONSE_TIMEOUT, wait).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} No response after {:?}", "⏰".yellow(), RESPONSE_TIMEOUT);
            eprintln!("{} The command may still be executing", "💡".yellow());
            Err("response timeout".into())
        }
    }
}

fn print_response(action: &str, response: &Value, format: &str) {
    let status = response["status"].as_str().unwrap_or("Unknown");
    let message = response["message"].as_str().unwrap_or_default();

    match format {
        "json" => println!("{}", response),
        "compact" => println!("{} {}", status, message),
        _ => match status {
            "Success" => {
                println!("{} {}: {}", "✅".green(), action.bright_white(), message.bright_green());
                match &response["data"] {
                    Value::Null => {}
                    data if data.get("connection_state").is_some() => print_status(data),
                    Value::Array(runs) => print_history(runs),
                    data => println!("{}", serde_json::to_string_pretty(data).unwrap_or_default()),
                }
            }
            "Error" => {
                let kind = response["error_kind"].as_str().unwrap_or("Error");
                println!("{} {} failed ({}): {}", "⚠️".yellow(), action.bright_white(), kind.bright_yellow(), message.bright_red());
                if kind == "ConnectionError" {
                    println!("{} Try: {}", "💡".yellow(), "dronewatch connect".bright_cyan());
                } else if message.contains("reset") {
                    println!("{} Try: {}", "💡".yellow(), "dronewatch patrol reset".bright_cyan());
                }
            }
            "NegativeAck" => {
                println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
            }
            other => println!("{} {} status {}: {}", "❓".blue(), action.bright_white(), other.bright_blue(), message),
        },
    }
}

fn print_status(status: &Value) {
    let connection = status["connection_state"].as_str().unwrap_or("unknown");
    let connection = match connection {
        "connected" => connection.bright_green(),
        "degraded" | "connecting" => connection.yellow(),
        _ => connection.bright_red(),
    };
    let battery = status["battery"]
        .as_u64()
        .map(|b| format!("{}%", b))
        .unwrap_or_else(|| "--".to_string());

    println!("\n{}", "📊 Flight Status".bright_blue().bold());
    println!("{}", "═══════════════".bright_blue());
    println!("{} {}", "Link:".bright_white(), connection);
    println!("{} {}", "Battery:".bright_white(), battery);
    println!(
        "{} {} at {}cm, heading {}°",
        "Flight:".bright_white(),
        if status["flight"]["is_flying"].as_bool().unwrap_or(false) { "airborne".bright_cyan() } else { "grounded".white() },
        status["flight"]["height_cm"].as_u64().unwrap_or(0),
        status["flight"]["heading"].as_i64().unwrap_or(0)
    );
    println!(
        "{} {} {}",
        "Patrol:".bright_white(),
        status["patrol"]["status"].as_str().unwrap_or("unknown").bright_cyan(),
        status["patrol"]["current_waypoint"].as_str().unwrap_or_default()
    );
    println!(
        "{} {} sent, {} failed, {} drops, avg {:.0}ms",
        "Commands:".bright_white(),
        status["metrics"]["commands_sent"].as_u64().unwrap_or(0),
        status["metrics"]["commands_failed"].as_u64().unwrap_or(0),
        status["metrics"]["connection_drops"].as_u64().unwrap_or(0),
        status["metrics"]["avg_response_ms"].as_f64().unwrap_or(0.0)
    );
}

fn print_history(runs: &[Value]) {
    println!("{}", "│ Run │ Type             │ Result    │ Corners │ Scans │ Threats │ Battery │".bright_white());
    for run in runs {
        let result = run["completion_status"].as_str().unwrap_or("?");
        let result = match result {
            "completed" => format!("{:<9}", result).green(),
            "stopped" => format!("{:<9}", result).yellow(),
            _ => format!("{:<9}", result).red(),
        };
        println!(
            "│ {:>3} │ {:<16} │ {} │ {:>7} │ {:>5} │ {:>7} │ {:>6}% │",
            run["id"].as_u64().unwrap_or(0),
            run["patrol_type"].as_str().unwrap_or("?"),
            result,
            run["corners_visited"].as_array().map_or(0, Vec::len),
            run["scans_completed"].as_u64().unwrap_or(0),
            run["threat_count"].as_u64().unwrap_or(0),
            run["battery_used"].as_u64().map(|b| b.to_string()).unwrap_or_else(|| "--".into())
        );
    }
}

async fn monitor(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();

    if format == "table" {
        println!("{}", "│ Time     │ Link         │ Battery │ Height │ Patrol     │".bright_white());
    }

    while let Some(line) = lines.next_line().await? {
        if format == "json" {
            println!("{}", line);
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let time = current_timestamp_ms() / 1000 % 100_000_000;
        match event["event"].as_str() {
            Some("status_update") if format == "table" => {
                println!(
                    "│ {:>8} │ {:<12} │ {:>7} │ {:>4}cm │ {:<10} │",
                    time,
                    event["connection_state"].as_str().unwrap_or("?"),
                    event["battery"].as_u64().map(|b| format!("{}%", b)).unwrap_or_else(|| "--".into()),
                    event["flight"]["height_cm"].as_u64().unwrap_or(0),
                    event["patrol"]["status"].as_str().unwrap_or("?")
                );
            }
            Some("status_update") => {
                println!(
                    "[{}] {} | {}% | {}",
                    time,
                    event["connection_state"].as_str().unwrap_or("?"),
                    event["battery"].as_u64().unwrap_or(0),
                    event["patrol"]["status"].as_str().unwrap_or("?")
                );
            }
            Some("threat_alert") => {
                println!(
                    "{} Threat at {}: {} ({:.0}%)",
                    "🚨".red(),
                    event["waypoint"].as_str().unwrap_or("?").bright_white(),
                    event["detection"]["class"].as_str().unwrap_or("?").bright_red(),
                    event["detection"]["confidence"].as_f64().unwrap_or(0.0) * 100.0
                );
            }
            Some("waypoint_reached") => {
                println!(
                    "{} Run {} reached {} ({}/{}, {}cm flown)",
                    "📍".cyan(),
                    event["run_id"].as_u64().unwrap_or(0),
                    event["waypoint"].as_str().unwrap_or("?").bright_white(),
                    event["reached"].as_u64().unwrap_or(0),
                    event["total"].as_u64().unwrap_or(0),
                    event["distance_traveled_cm"].as_u64().unwrap_or(0)
                );
            }
            Some("connection_lost") | Some("link_failure") | Some("emergency_stop") => {
                println!("{} {}", "⚠️".yellow(), line.bright_red());
            }
            Some(name) => println!("{} {}", "•".dimmed(), format!("{}: {}", name, line).dimmed()),
            None => {}
        }
    }

    Ok(())
}
