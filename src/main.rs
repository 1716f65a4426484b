//! Command-line front end for the `wasm-link` crate.

use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tempfile::NamedTempFile;
use wasm_link::{LinkOptions, Linker, OutputStream};

/// Link relocatable WebAssembly object modules into one module.
#[derive(Parser)]
#[command(version)]
struct Opts {
    /// Input object files, processed in command-line order.
    #[arg(required = true, value_name = "OBJECTS")]
    inputs: Vec<PathBuf>,

    /// Where to place the linked module.
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Export an additional defined function from the output. May be
    /// repeated.
    #[arg(long = "export", value_name = "SYMBOL")]
    exports: Vec<String>,

    /// Do not emit a `name` section.
    #[arg(long)]
    no_names: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Opts::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: Opts) -> Result<()> {
    let mut linker = Linker::new(LinkOptions {
        export_symbols: opts.exports,
        emit_names: !opts.no_names,
    });
    for path in &opts.inputs {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        linker.add_module(&name, bytes)?;
    }

    // Link into a temporary file next to the output so a failed link never
    // clobbers an existing module.
    let dir = match opts.output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = NamedTempFile::new_in(dir).context("failed to create temporary output")?;
    let mut stream = FileStream::new(temp);
    linker.link(&mut stream)?;
    stream
        .into_inner()
        .persist(&opts.output)
        .with_context(|| format!("failed to write `{}`", opts.output.display()))?;
    info!("wrote `{}`", opts.output.display());
    Ok(())
}

/// An [`OutputStream`] over a temporary file, patching by seeking.
struct FileStream {
    file: NamedTempFile,
    position: u64,
}

impl FileStream {
    fn new(file: NamedTempFile) -> FileStream {
        FileStream { file, position: 0 }
    }

    fn into_inner(self) -> NamedTempFile {
        self.file
    }
}

impl OutputStream for FileStream {
    fn position(&self) -> usize {
        self.position as usize
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.as_file_mut().write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(bytes)?;
        file.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opts::command().debug_assert()
    }

    #[test]
    fn file_stream_patches_in_place() {
        let temp = NamedTempFile::new().unwrap();
        let mut stream = FileStream::new(temp);
        stream.write(&[1, 2, 3, 4]).unwrap();
        stream.patch(1, &[9, 9]).unwrap();
        stream.write(&[5]).unwrap();
        assert_eq!(stream.position(), 5);
        let bytes = std::fs::read(stream.into_inner().path()).unwrap();
        assert_eq!(bytes, [1, 9, 9, 4, 5]);
    }
}
