use clap::{Parser, Subcommand};
use flute::cenc::ContentEncoding;
use flute::oti::FecEncodingId;
use flute::partition::partition;
use flute::receiver::{FsWriter, MultiReceiver, ObjectMeta, ObjectWriter, ReceiverConfig, UdpEndpoint, WriterError};
use flute::sender::{ObjectOptions, Sender, SenderConfig, DEFAULT_INTERLEAVE_BLOCKS, DEFAULT_MAX_PAYLOAD_SIZE};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "flute", about = "File delivery over unidirectional transport")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files to a unicast or multicast destination
    Send {
        /// Destination, e.g. 239.255.0.1:3400
        #[arg(short, long)]
        dest: SocketAddr,
        #[arg(short, long, default_value = "1")]
        tsi: u64,
        /// Encoding symbol length in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
        symbol_length: u16,
        /// Source symbols per block
        #[arg(long, default_value = "64")]
        block_length: u32,
        /// FEC scheme: nocode (default), rs28
        #[arg(long, default_value = "nocode")]
        fec: String,
        /// Repair symbols per block (rs28 only)
        #[arg(long, default_value = "0")]
        parity: u16,
        /// Source blocks between FDT repeats, 0 for once per publish
        #[arg(long, default_value_t = DEFAULT_INTERLEAVE_BLOCKS)]
        interleave: u32,
        /// Pause between packets in microseconds
        #[arg(long, default_value = "0")]
        pace_us: u64,
        /// Content encoding: null (default), zlib, deflate, gzip
        #[arg(long, default_value = "null")]
        cenc: String,
        /// Times each file is transmitted
        #[arg(long, default_value = "1")]
        repeat: u32,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Receive objects into a directory
    Receive {
        /// Local address to bind, e.g. 0.0.0.0:3400
        #[arg(short, long)]
        bind: SocketAddr,
        /// Multicast group to join
        #[arg(short, long)]
        group: Option<IpAddr>,
        #[arg(short = 'C', long, default_value = ".")]
        output: PathBuf,
        /// Only accept these sessions
        #[arg(long)]
        tsi: Vec<u64>,
        /// Exit after this many objects
        #[arg(long)]
        count: Option<usize>,
    },
    /// Show how an object of the given size is split into blocks
    Plan {
        #[arg(long)]
        size: u64,
        #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
        symbol_length: u16,
        #[arg(long, default_value = "64")]
        block_length: u32,
        #[arg(long, default_value = "nocode")]
        fec: String,
        #[arg(long, default_value = "0")]
        parity: u16,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flute=info".into()),
        )
        .init();

    match Cli::parse().command {

        // ── Send ─────────────────────────────────────────────────────────────
        Commands::Send {
            dest, tsi, symbol_length, block_length, fec, parity, interleave, pace_us, cenc, repeat, files,
        } => {
            let content_encoding = ContentEncoding::from_name(&cenc)
                .ok_or_else(|| format!("Unknown content encoding '{cenc}', expected null, zlib, deflate or gzip"))?;
            let config = SenderConfig {
                max_payload_size: symbol_length,
                fec_encoding: parse_fec(&fec)?,
                max_source_block_length: block_length,
                max_number_of_parity_symbols: parity,
                interleave_blocks: interleave,
                ..SenderConfig::default()
            };
            let socket = UdpSocket::bind(match dest {
                SocketAddr::V4(_) => "0.0.0.0:0",
                SocketAddr::V6(_) => "[::]:0",
            })?;
            if dest.ip().is_multicast() && dest.is_ipv4() {
                socket.set_multicast_ttl_v4(8)?;
            }

            let mut sender = Sender::new(tsi, config)?;
            for path in &files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| format!("{} has no file name", path.display()))?;
                let data = std::fs::read(path)?;
                let len = data.len();
                let options = ObjectOptions { content_encoding, max_transfer_count: repeat, ..ObjectOptions::default() };
                let toi = sender.add_object_with(data, "application/octet-stream", &name, options)?;
                println!("  queued  toi={toi:<6} {len:>12} B  {name}");
            }
            sender.set_complete();
            sender.publish()?;

            let mut sent = 0u64;
            while let Some(pkt) = sender.read() {
                socket.send_to(&pkt, dest)?;
                sent += 1;
                if pace_us > 0 {
                    std::thread::sleep(Duration::from_micros(pace_us));
                }
            }
            socket.send_to(&sender.close_session_packet()?, dest)?;
            println!("Sent {sent} packets to {dest} (TSI {tsi})");
        }

        // ── Receive ──────────────────────────────────────────────────────────
        Commands::Receive { bind, group, output, tsi, count } => {
            let socket = UdpSocket::bind(bind)?;
            match group {
                Some(IpAddr::V4(g)) => socket.join_multicast_v4(&g, &std::net::Ipv4Addr::UNSPECIFIED)?,
                Some(IpAddr::V6(g)) => socket.join_multicast_v6(&g, 0)?,
                None => {}
            }
            socket.set_read_timeout(Some(Duration::from_secs(1)))?;

            let writer = Arc::new(CountingWriter { inner: FsWriter::new(&output)?, count: AtomicUsize::new(0) });
            let multi = MultiReceiver::new(writer.clone(), ReceiverConfig::default());
            for t in &tsi {
                multi.add_listen_tsi(*t);
            }
            let endpoint = UdpEndpoint::new(None, group.unwrap_or(bind.ip()), bind.port());
            println!("Listening on {bind}, writing to {}", output.display());

            let mut buf = vec![0u8; 65536];
            let mut last_cleanup = Instant::now();
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, _)) => multi.push(&endpoint, &buf[..n]),
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                    Err(e) => return Err(e.into()),
                }
                if last_cleanup.elapsed() >= Duration::from_secs(5) {
                    multi.cleanup();
                    last_cleanup = Instant::now();
                }
                let received = writer.count.load(Ordering::Relaxed);
                if count.is_some_and(|c| received >= c) {
                    println!("Received {received} object(s)");
                    break;
                }
            }
        }

        // ── Plan ─────────────────────────────────────────────────────────────
        Commands::Plan { size, symbol_length, block_length, fec, parity } => {
            let config = SenderConfig {
                max_payload_size: symbol_length,
                fec_encoding: parse_fec(&fec)?,
                max_source_block_length: block_length,
                max_number_of_parity_symbols: parity,
                ..SenderConfig::default()
            };
            let oti = config.oti().with_transfer_length(size);
            oti.validate()?;
            let layout = partition(size, &oti)?;
            let codec = flute::get_codec(oti.fec_encoding_id);

            println!("── Layout ───────────────────────────────────────────────");
            println!("  FEC             {}", oti.fec_encoding_id.name());
            println!("  Transfer length {size} B");
            println!("  Symbol length   {symbol_length} B");
            println!("  Blocks          {}", layout.nb_blocks());
            println!("  Source symbols  {}", layout.nb_symbols());
            println!("{:>8} {:>10} {:>8} {:>14} {:>14}", "SBN", "Symbols", "Repair", "Offset", "Bytes");
            for b in &layout.blocks {
                println!("{:>8} {:>10} {:>8} {:>14} {:>14}",
                    b.sbn, b.symbol_count, codec.nb_repair_symbols(b, &oti), b.offset, b.block_byte_length);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

struct CountingWriter {
    inner: FsWriter,
    count: AtomicUsize,
}

impl ObjectWriter for CountingWriter {
    fn write(&self, meta: &ObjectMeta, data: &[u8]) -> Result<(), WriterError> {
        self.inner.write(meta, data)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        println!("  received toi={:<6} {:>12} B  {}", meta.toi, data.len(), meta.content_location);
        Ok(())
    }
}

fn parse_fec(s: &str) -> Result<FecEncodingId, String> {
    FecEncodingId::from_name(s).ok_or_else(|| format!("Unknown FEC scheme '{s}', expected nocode or rs28"))
}
