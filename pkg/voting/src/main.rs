extern crate clap;
extern crate ctrlc;
extern crate env_logger;
extern crate log;
extern crate voting;

use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use log::info;

use voting::config::{Config, MCAST_GRP, MCAST_PORT};
use voting::errors::*;
use voting::server::Server;

fn main() {
	env_logger::init();

	if let Err(e) = run() {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}

fn run() -> Result<()> {
	let matches = App::new("voting-server")
		.about("Fault-tolerant distributed voting service node")
		.arg(Arg::with_name("port").value_name("PORT").help("UDP port this node listens on").required(true).index(1))
		.arg(
			Arg::with_name("bind-ip")
				.long("bind-ip")
				.value_name("IP")
				.help("Local address to bind the unicast socket to")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("mcast-group")
				.long("mcast-group")
				.value_name("ADDR")
				.help("Multicast group address used for membership gossip")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("mcast-port")
				.long("mcast-port")
				.value_name("PORT")
				.help("Multicast group port")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("tick-ms")
				.long("tick-ms")
				.value_name("MS")
				.help("Announce and heartbeat tick interval")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("hb-timeout-ms")
				.long("hb-timeout-ms")
				.value_name("MS")
				.help("Heartbeat deadline before declaring the predecessor crashed")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("settle-delay-ms")
				.long("settle-delay-ms")
				.value_name("MS")
				.help("Settling delay before starting an election after a join or crash")
				.takes_value(true),
		)
		.get_matches();

	let mut config = Config::default();
	config.port = matches
		.value_of("port")
		.unwrap()
		.parse()
		.chain_err(|| "PORT must be a valid u16")?;

	if let Some(bind) = matches.value_of("bind-ip") {
		config.bind_ip = bind.to_string();
	}
	if let Some(group) = matches.value_of("mcast-group") {
		config.mcast_group = group.to_string();
	} else {
		config.mcast_group = MCAST_GRP.to_string();
	}
	if let Some(port) = matches.value_of("mcast-port") {
		config.mcast_port = port.parse().chain_err(|| "--mcast-port must be a valid u16")?;
	} else {
		config.mcast_port = MCAST_PORT;
	}
	if let Some(ms) = matches.value_of("tick-ms") {
		let ms: u64 = ms.parse().chain_err(|| "--tick-ms must be a valid integer")?;
		config.tick = Duration::from_millis(ms);
	}
	if let Some(ms) = matches.value_of("hb-timeout-ms") {
		let ms: u64 = ms.parse().chain_err(|| "--hb-timeout-ms must be a valid integer")?;
		config.hb_timeout = Duration::from_millis(ms);
	}
	if let Some(ms) = matches.value_of("settle-delay-ms") {
		let ms: u64 = ms.parse().chain_err(|| "--settle-delay-ms must be a valid integer")?;
		config.settle_delay = Duration::from_millis(ms);
	}

	let server = Arc::new(Server::new(config).chain_err(|| "failed to bind sockets")?);

	let shutdown_handle = server.clone();
	ctrlc::set_handler(move || {
		info!("received shutdown signal");
		shutdown_handle.request_shutdown();
	})
	.chain_err(|| "failed to install signal handler")?;

	server.run();
	Ok(())
}
