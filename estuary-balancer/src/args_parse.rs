use anyhow::Result;
use std::env;

pub(crate) struct Args {
    pub(crate) config_file: String,
    pub(crate) prom_exporter: Option<String>,
    pub(crate) reassignment_interval: Option<u64>,
    pub(crate) once: bool,
}

impl Args {
    fn show_usage() {
        println!("Estuary Balancer Usage:");
        println!("  --config-file             Path to config file (required)");
        println!("  --prom-exporter           Prometheus Exporter http address");
        println!("  --reassignment-interval   Seconds between reassignment cycles (overrides config)");
        println!("  --once                    Compute and roll out one placement, then exit");
    }

    pub(crate) fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().collect();

        if args.len() <= 1 {
            Self::show_usage();
            return Err(anyhow::anyhow!("No arguments provided"));
        }

        let mut config_file = None;
        let mut prom_exporter = None;
        let mut reassignment_interval = None;
        let mut once = false;

        let mut args_iter = args.iter().skip(1);
        while let Some(arg) = args_iter.next() {
            match arg.as_str() {
                "--config-file" => {
                    config_file = args_iter.next().map(|s| s.to_string());
                }
                "--prom-exporter" => {
                    prom_exporter = args_iter.next().map(|s| s.to_string());
                }
                "--reassignment-interval" => {
                    reassignment_interval = match args_iter.next() {
                        Some(value) => Some(value.parse::<u64>().map_err(|_| {
                            anyhow::anyhow!("Invalid --reassignment-interval: {}", value)
                        })?),
                        None => None,
                    };
                }
                "--once" => {
                    once = true;
                }
                _ => return Err(anyhow::anyhow!("Unknown argument: {}", arg)),
            }
        }

        Ok(Args {
            config_file: config_file
                .ok_or_else(|| anyhow::anyhow!("Missing required --config-file"))?,
            prom_exporter,
            reassignment_interval,
            once,
        })
    }
}
