//! Thin launcher: argument parsing and runtime setup only; everything
//! interesting lives in the library.

use tidelog::{FeederParam, Node, NodeConfig};

fn usage() -> ! {
    eprintln!("usage: tidelog DATA_DIR [--listen ADDR] [--feeder ADDR] [--fold]");
    std::process::exit(2);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(data_dir) = args.next() else { usage() };
    let mut config = NodeConfig::new(&data_dir).with_listen("127.0.0.1:33013");
    let mut fold = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => match args.next() {
                Some(addr) => config = config.with_listen(addr),
                None => usage(),
            },
            "--feeder" => match args.next() {
                Some(addr) => config = config.with_feeder(FeederParam::new(addr)),
                None => usage(),
            },
            "--fold" => fold = true,
            _ => usage(),
        }
    }

    if fold {
        if let Err(e) = Node::fold(config) {
            eprintln!("fold failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let local = tokio::task::LocalSet::new();
    let result = local.block_on(&runtime, Node::run(config));
    if let Err(e) = result {
        eprintln!("node failed: {}", e);
        std::process::exit(1);
    }
}
