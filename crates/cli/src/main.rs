use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use http::{HeaderMap, Method, Request, StatusCode, Version};
use micro_http_client::{Body, FinalStatus, Listener, Progress, Response, ResponseHeader, SyncTransaction, Transaction};
use micro_runloop::{RunLoop, RunLoopHandle};
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

/// micro-get - fetch a url and print the response body
#[derive(Parser, Debug)]
#[command(name = "micro-get")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Drive the transaction on a run loop on this thread instead of blocking
    #[arg(long = "async")]
    asynchronous: bool,

    /// Print the status line and response headers before the body
    #[arg(long)]
    headers: bool,

    /// POST the contents of this file
    #[arg(long, value_name = "FILE")]
    post: Option<PathBuf>,

    /// Per step timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30.0)]
    timeout: f64,

    #[arg(long, value_name = "LEVEL", default_value_t = Level::WARN)]
    log_level: Level,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    url: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("can't set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let request = match build_request(&args) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    debug!(method = %request.method(), url = %request.uri(), asynchronous = args.asynchronous, "fetching");

    if args.asynchronous { run_async(request, &args) } else { run_sync(request, &args) }
}

fn init_logging(args: &Args) -> io::Result<()> {
    let installed = match &args.log_file {
        Some(path) => {
            let file = File::create(path)?;
            let subscriber =
                FmtSubscriber::builder().with_max_level(args.log_level).with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).with_writer(io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(io::Error::other)
}

fn build_request(args: &Args) -> Result<Request<Body>, http::Error> {
    let (method, body) = match &args.post {
        Some(path) => (Method::POST, Body::file(path)),
        None => (Method::GET, Body::Empty),
    };
    Request::builder().method(method).uri(args.url.as_str()).body(body)
}

fn write_head<W: Write>(out: &mut W, version: Version, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
    writeln!(out, "{version:?} {status}")?;
    for (name, value) in headers {
        writeln!(out, "{name}: {}", String::from_utf8_lossy(value.as_bytes()))?;
    }
    writeln!(out)
}

fn write_body<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    out.flush()
}

fn print_response(response: &Response, headers: bool) -> io::Result<()> {
    let mut out = io::stdout().lock();
    if headers {
        write_head(&mut out, response.version(), response.status(), response.headers())?;
    }
    write_body(&mut out, response.body())
}

fn run_sync(request: Request<Body>, args: &Args) -> ExitCode {
    let transaction = SyncTransaction::alloc(request);
    transaction.set_timeout_sec(args.timeout);

    let (response, status) = transaction.execute();
    match status {
        FinalStatus::Ok => {
            if let Err(e) = print_response(&response, args.headers) {
                error!(cause = %e, "can't write the response");
                return ExitCode::FAILURE;
            }
        }
        FinalStatus::TimedOut => println!("timed out"),
        FinalStatus::Cancelled => println!("cancelled"),
        FinalStatus::Error(message) => println!("error: {message}"),
    }
    ExitCode::SUCCESS
}

/// Prints as the transaction goes and stops the run loop when it ends.
struct Printer {
    headers: bool,
    run_loop: Option<RunLoopHandle>,
    closed: Arc<AtomicBool>,
    output_failed: Arc<AtomicBool>,
}

impl Printer {
    fn stop(&self) {
        if let Some(run_loop) = &self.run_loop {
            run_loop.stop();
        }
    }

    /// Gives up on the transaction once stdout can't take any more output.
    fn check(&self, written: io::Result<()>) {
        if let Err(e) = written {
            error!(cause = %e, "can't write the response");
            self.output_failed.store(true, Ordering::Release);
            self.stop();
        }
    }
}

fn describe(label: &str, progress: Progress) -> String {
    match progress.total {
        Some(total) => format!("{label}: {} of {total} ({:.0}%)", progress.processed, progress.percent),
        None => format!("{label}: {} of unknown", progress.processed),
    }
}

impl Listener for Printer {
    fn on_redirect(&mut self, new_url: &http::Uri) {
        eprintln!("redirected to {new_url}");
    }

    fn on_response_status(&mut self, head: &ResponseHeader) {
        if self.headers {
            self.check(write_head(&mut io::stdout().lock(), head.version(), head.status(), head.headers()));
        }
    }

    fn on_response_body_bytes(&mut self, bytes: &[u8]) {
        self.check(write_body(&mut io::stdout().lock(), bytes));
    }

    fn on_send_progress(&mut self, progress: Progress) {
        eprintln!("{}", describe("sendProgress", progress));
    }

    fn on_receive_progress(&mut self, progress: Progress) {
        eprintln!("{}", describe("receiveProgress", progress));
    }

    fn on_closed(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.stop();
    }

    fn on_timeout(&mut self) {
        println!("timed out");
        self.stop();
    }

    fn on_cancel(&mut self) {
        println!("cancelled");
        self.stop();
    }

    fn on_error(&mut self, message: &str) {
        println!("error: {message}");
        self.stop();
    }
}

fn run_async(request: Request<Body>, args: &Args) -> ExitCode {
    let mut run_loop = RunLoop::new();
    run_loop.init();

    let closed = Arc::new(AtomicBool::new(false));
    let output_failed = Arc::new(AtomicBool::new(false));
    let printer = Printer {
        headers: args.headers,
        run_loop: run_loop.handle(),
        closed: Arc::clone(&closed),
        output_failed: Arc::clone(&output_failed),
    };

    let mut transaction = Transaction::new(request);
    transaction.set_timeout_sec(args.timeout);
    if let Err(e) = transaction.initiate(printer) {
        error!(cause = %e, "can't start transaction");
        println!("error: {e}");
        return ExitCode::FAILURE;
    }

    run_loop.run();
    drop(transaction);
    run_loop.shutdown();

    if closed.load(Ordering::Acquire) && !output_failed.load(Ordering::Acquire) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
