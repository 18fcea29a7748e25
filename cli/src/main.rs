use clap::Parser;
use mgpu_cli::args::{Cli, Command};
use mgpu_cli::client::{pump_stream, Client, Timeouts};
use mgpu_cli::exit_codes;
use mgpu_proto::message::{JobView, NodeView};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mgpu: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> mgpu_cli::client::Result<i32> {
    match cli.command {
        Command::Submit(args) => {
            let client = Client::new(
                &cli.master_host,
                cli.master_port,
                Timeouts::from(args.timeouts),
            );
            let spec = args.to_spec();
            let (job_id, stream) = client.submit(spec).await?;
            match stream {
                None => {
                    println!("{job_id}");
                    Ok(exit_codes::OK)
                }
                Some(wire) => {
                    eprintln!("mgpu: submitted {job_id}, streaming output");
                    pump_stream(wire, &job_id, &client).await
                }
            }
        }
        Command::Queue => {
            let client =
                Client::new(&cli.master_host, cli.master_port, Timeouts::default());
            let (jobs, nodes) = client.queue().await?;
            print_queue(&jobs, &nodes);
            Ok(exit_codes::OK)
        }
        Command::Cancel { job_id, timeouts } => {
            let client =
                Client::new(&cli.master_host, cli.master_port, Timeouts::from(timeouts));
            let prior = client.cancel(&job_id).await?;
            println!("cancelled {job_id} (was {})", status_label(prior));
            Ok(exit_codes::OK)
        }
        Command::Monitor { job_id, timeouts } => {
            let client =
                Client::new(&cli.master_host, cli.master_port, Timeouts::from(timeouts));
            let wire = client.attach(&job_id).await?;
            pump_stream(wire, &job_id, &client).await
        }
    }
}

fn status_label(status: mgpu_proto::message::JobStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}

fn print_queue(jobs: &[JobView], nodes: &[NodeView]) {
    println!("JOBS");
    if jobs.is_empty() {
        println!("  (none)");
    }
    for job in jobs {
        let placement = if job.assignment.is_empty() {
            String::new()
        } else {
            let nodes: Vec<String> = job
                .assignment
                .iter()
                .map(|share| {
                    let gpus: Vec<String> =
                        share.gpu_ids.iter().map(u32::to_string).collect();
                    format!("{}:{}", share.node_id, gpus.join(","))
                })
                .collect();
            format!(" on {}", nodes.join(" "))
        };
        println!(
            "  {}  {:<10}  prio {:>3}  {} gpu(s)  {}  {}{}",
            job.id,
            status_label(job.status),
            job.priority,
            job.gpus,
            job.owner,
            job.command,
            placement
        );
    }

    println!("NODES");
    if nodes.is_empty() {
        println!("  (none)");
    }
    for node in nodes {
        let free: Vec<String> = node.free_gpus.iter().map(u32::to_string).collect();
        println!(
            "  {}  {:<8}  {}/{} free [{}]  failures {}",
            node.node_id,
            format!("{:?}", node.status).to_lowercase(),
            node.free_gpus.len(),
            node.total_gpus,
            free.join(","),
            node.failure_count
        );
    }
}
