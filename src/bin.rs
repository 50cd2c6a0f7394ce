use std::sync::Arc;

use burrow::cmd::{self, CmdOpts};
use burrow::conf::{FullConf, LogConf};
use burrow::core::{Allocator, LogView, Proxy, View};
use burrow::forward::{default_connector, Forwarder};

fn main() {
    let opts = cmd::scan();

    let mut conf = match FullConf::from_conf_file(&opts.config) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    conf.apply_cmd_opts(&opts);

    setup_log(&conf.log);
    log::info!("[main]burrow {}, log: {}", burrow::VERSION, conf.log);

    run(conf, &opts)
}

fn setup_log(log: &LogConf) {
    let (level, output) = match log.build() {
        Ok(x) => x,
        Err(e) => {
            eprintln!("unable to open log output {}: {}", log.output, e);
            std::process::exit(1);
        }
    };

    let res = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}]{}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(output)
        .apply();

    if let Err(e) = res {
        eprintln!("failed to setup logger: {}", e);
    }
}

fn run(conf: FullConf, opts: &CmdOpts) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "multi-thread")] {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build();
        } else {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build();
        }
    }

    let rt = match rt {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[main]failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    rt.block_on(serve(conf, opts))
}

async fn serve(conf: FullConf, opts: &CmdOpts) {
    let view: Arc<dyn View> = Arc::new(LogView);
    let allocator = Allocator::new(conf.relay.allocator_opts());
    let proxy = Arc::new(Proxy::new(view.clone(), conf.relay.hostfile(), allocator));
    let forwarder = Arc::new(Forwarder::new(
        proxy,
        view,
        default_connector(),
        conf.relay.forwarder_opts(),
    ));

    let specs = conf.forward_specs();
    let total = specs.len();
    let started = forwarder.forward_all(specs).await;
    log::info!("[main]{}/{} forwards started from {}", started, total, opts.config);

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("[main]unable to listen for shutdown signal: {}", e);
    }

    log::info!("[main]shutting down");
    forwarder.stop().await;
}
