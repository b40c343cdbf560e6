use tracing_subscriber::EnvFilter;
use usbtmc_session::{Config, Connector, RusbHost};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    usbtmc_session::init();

    let connector = Connector::new(RusbHost::new(), Config::default().debug(true));

    let mut session = match connector.open_with_ecid(0) {
        Ok(s) => s,
        Err(e) => {
            dbg!("open dev error", e);
            return;
        }
    };

    session.usbtmc_init();
    match session.query_str("*IDN?", 256) {
        Ok(idn) => println!("{}", idn.trim_end()),
        Err(e) => {
            dbg!("query failed", e.code(), usbtmc_session::strerror(e.code()));
        }
    }

    session.close();
    usbtmc_session::exit();
}
