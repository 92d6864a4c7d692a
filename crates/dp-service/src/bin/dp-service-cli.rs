#![forbid(unsafe_code)]

use std::io::Read;
use std::process::ExitCode;

use dp_service::AnalysisService;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(status) => {
            if status == 200 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(error) => {
            eprintln!("dp-service-cli error: {error}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<u16, String> {
    let mut input: Option<String> = None;
    let mut content_type = "application/json".to_owned();
    let mut accept: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                let value = args.next().ok_or("--input requires a file path")?;
                input = Some(value);
            }
            "--content-type" => {
                content_type = args.next().ok_or("--content-type requires a value")?;
            }
            "--accept" => {
                accept = Some(args.next().ok_or("--accept requires a value")?);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(200);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let body = match input {
        Some(path) => {
            std::fs::read_to_string(&path).map_err(|error| format!("cannot read {path}: {error}"))?
        }
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|error| format!("cannot read stdin: {error}"))?;
            buffer
        }
    };

    let service = AnalysisService::default();
    let reply = service.handle_request(&body, &content_type, accept.as_deref());

    eprintln!("status={} media_type={}", reply.status, reply.media_type);
    println!("{}", reply.body);
    Ok(reply.status)
}

fn print_help() {
    println!(
        "usage: dp-service-cli [--input FILE] [--content-type MIME] [--accept MIME]\n\
         \n\
         Reads an analysis request from FILE (or stdin), runs the preprocessing\n\
         and indicator pipeline, and prints the encoded reply on stdout.\n\
         Default content type: application/json."
    );
}
