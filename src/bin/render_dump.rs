//! Render one file through the same dispatcher the daemon uses and print
//! the HTML, without starting a server.

use std::{env, error::Error, fs, path::PathBuf};

use clap::Parser;
use markdownd::{
    application::render::build_dispatcher,
    config::{self, CliArgs},
    domain::frame,
};

const USAGE: &str = "usage: render_dump [--mode <tag>] <markdown_path>";

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().skip(1);
    let mut mode = None;
    let mut path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" | "-m" => mode = Some(args.next().ok_or(USAGE)?),
            other if path.is_none() => path = Some(PathBuf::from(other)),
            _ => return Err(USAGE.into()),
        }
    }
    let path = path.ok_or(USAGE)?;

    let content = fs::read(&path)?;
    let frame = frame::decode(&frame::encode(mode.as_deref(), &content)?);

    // Config files and environment (EDITOR_MD included) apply as for the daemon.
    let settings = config::load(&CliArgs::parse_from(["render_dump"]))?;
    let dispatcher = build_dispatcher(&settings.render)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let reply = runtime.block_on(dispatcher.dispatch(&frame))?;

    eprintln!(
        "mode={} path={} output={:?} incomplete={} elapsed={:?}",
        frame.mode(),
        reply.path.as_str(),
        reply.output,
        reply.possibly_incomplete,
        reply.elapsed
    );
    println!("{}", reply.html);
    Ok(())
}
