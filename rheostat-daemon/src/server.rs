// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use rheostat_common::config::ConfigLoader;
use rheostat_common::tracing::init_tracing_with_default_env_filter;
use rheostat_daemon::config::{make_config_loader, DaemonConfig};
use rheostat_daemon::services::policy;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rheostat-daemon", about = "Run-time resource manager")]
struct Args {
    /// Configuration file path.
    #[arg(short, long, default_value = "/etc/rheostat/rheostat.toml")]
    config: PathBuf,

    /// Stay attached to the terminal. The daemon always runs in the
    /// foreground; the flag is accepted for launcher compatibility.
    #[arg(short, long)]
    foreground: bool,

    /// Directory to look up policy plugins in. Recorded only; policies
    /// are compiled in.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Run the built-in policy self-test and exit.
    #[arg(long)]
    self_test: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.dump_config {
        print!("{}", ConfigLoader::<DaemonConfig>::dump_default()?);
        return Ok(());
    }

    if args.self_test {
        policy::self_test()?;
        println!("policy self-test passed");
        return Ok(());
    }

    let config = make_config_loader(&args.config).load()?;
    init_tracing_with_default_env_filter(&config.tracing);

    if let Some(plugins_dir) = &args.plugins_dir {
        tracing::info!(dir = %plugins_dir.display(), "plugins directory noted, policies are compiled in");
    }

    let _registry = rheostat_daemon::metrics::register_all();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(rheostat_daemon::run(config))?;
    Ok(())
}
