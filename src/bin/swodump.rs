use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;
use swotrace::{Trace, TraceLink};

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Dump SWO trace lines from a Black Magic Probe network trace endpoint. Stimulus packets are decoded per the ARMv7-M architecture reference manual, Appendix D4. See <https://developer.arm.com/documentation/ddi0403/ed/>."
)]
struct Opt {
    #[structopt(
        long = "--host",
        default_value = "127.0.0.1",
        help = "Host the trace server runs on."
    )]
    host: Ipv4Addr,

    #[structopt(name = "PORT", help = "TCP port of the SWO trace server.")]
    port: u16,

    #[structopt(
        short = "-c",
        long = "--channel",
        help = "Stimulus channels to enable (default: channel 0 only)."
    )]
    channels: Vec<u8>,

    #[structopt(
        long = "--data-size",
        help = "Stimulus data word size in bytes: 1 (text), 2 or 4 (hex words)."
    )]
    data_size: Option<u8>,

    #[structopt(
        long = "--save",
        parse(from_os_str),
        help = "Export the captured lines as CSV on exit."
    )]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut trace = Trace::new();
    for &channel in &opt.channels {
        trace.channels.set_enabled(channel, true);
    }
    if let Some(size) = opt.data_size {
        if !trace.set_data_size(size, size == 1) {
            bail!("{} is not a valid data size; valid sizes are: 1, 2, 4.", size);
        }
    }

    trace
        .start(TraceLink::Tcp(SocketAddrV4::new(opt.host, opt.port)))
        .with_context(|| format!("failed to connect to {}:{}", opt.host, opt.port))?;

    let mut printed = 0;
    loop {
        thread::sleep(Duration::from_millis(100));
        trace.process_text(true);

        while printed < trace.store.len() && trace.store.lines()[printed].is_sealed() {
            let line = &trace.store.lines()[printed];
            println!(
                "{time} [{reltime}] {name}> {text}",
                time = chrono::Utc::now().format("%H:%M:%S%.3f"),
                reltime = line.timefmt(),
                name = trace.channels.name(line.channel),
                text = line.text_lossy(),
            );
            printed += 1;
        }

        let dropped = trace.take_overflow();
        if dropped > 0 {
            eprintln!("Warning: {} frames lost to ring overflow", dropped);
        }

        if !trace.is_running() && trace.pending_frames() == 0 {
            break;
        }
    }

    // drain whatever the server sent before closing
    trace.process_text(true);
    for line in &trace.store.lines()[printed..] {
        println!(
            "{time} [{reltime}] {name}> {text}",
            time = chrono::Utc::now().format("%H:%M:%S%.3f"),
            reltime = line.timefmt(),
            name = trace.channels.name(line.channel),
            text = line.text_lossy(),
        );
    }
    for entry in trace.status.entries() {
        eprintln!("[{}] {}", entry.code, entry.text);
    }
    if trace.packet_errors() > 0 {
        eprintln!("Warning: {} packets dropped on decode errors", trace.packet_errors());
    }

    if let Some(path) = &opt.save {
        trace
            .store
            .save(path, &trace.channels)
            .with_context(|| format!("failed to save {:?}", path))?;
    }

    trace.close();
    Ok(())
}
