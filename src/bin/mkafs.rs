use std::path::PathBuf;

use failure::Error;
use log::debug;
use pretty_env_logger;
use structopt::StructOpt;

use afs::crypt::{derive_access_keys, CryptStore};
use afs::store::{Consistency, FileStore};
use afs::{Afs, AfsTime, CaseSensitivity};

#[derive(Debug, StructOpt)]
#[structopt(name = "mkafs", about = "Create an on-disk Afs file system.")]
struct Opt {
    /// Data file path
    #[structopt(parse(from_os_str))]
    data_path: PathBuf,
    /// Block size, in bytes
    #[structopt(short = "s", long = "block-size", default_value = "4096")]
    block_size: u32,
    /// Maximum number of blocks
    #[structopt(short = "c", long = "block-count", default_value = "65536")]
    block_count: u64,
    /// Encrypt the store; prompts for a password unless given
    #[structopt(short = "e", long = "encrypt")]
    encrypt: bool,
    /// Password for --encrypt
    #[structopt(short = "p", long = "password")]
    password: Option<String>,
    /// Case-sensitive name lookups (default is case-insensitive)
    #[structopt(long = "case-sensitive")]
    case_sensitive: bool,
}

fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("running with options {:?}", opt);

    let case = if opt.case_sensitive {
        CaseSensitivity::Exact
    } else {
        CaseSensitivity::Insensitive
    };

    let store = FileStore::create(&opt.data_path, opt.block_size, opt.block_count, Consistency::Journal)?;

    if opt.encrypt {
        let password = opt
            .password
            .unwrap_or_else(|| rpassword::read_password_from_tty(Some("password: ")).unwrap());
        let salt = opt.data_path.to_string_lossy().into_owned();
        let (encr_key, mac_key) = derive_access_keys(&password, salt.as_bytes());
        let store = CryptStore::init(store, &encr_key, &mac_key)?
            .ok_or_else(|| failure::format_err!("failed to initialize key block"))?;
        let mut fs = Afs::new(store, case);
        fs.init(b"", AfsTime::now())?;
    } else {
        let mut fs = Afs::new(store, case);
        fs.init(b"", AfsTime::now())?;
    }

    println!(
        "Created new Afs file system with {} {}-byte blocks at {:?}.",
        opt.block_count, opt.block_size, opt.data_path
    );
    Ok(())
}
