use std::path::PathBuf;

use log::debug;
use pretty_env_logger;
use structopt::StructOpt;

use afs::crypt::{derive_access_keys, CryptStore};
use afs::store::{BlockStore, Consistency, FileStore};
use afs::{Afs, CaseSensitivity};

#[derive(Debug, StructOpt)]
#[structopt(name = "ckafs", about = "Check an on-disk Afs file system.")]
struct Opt {
    /// Data file path
    #[structopt(parse(from_os_str))]
    data_path: PathBuf,
    /// Maximum number of blocks the store was created with
    #[structopt(short = "c", long = "block-count", default_value = "65536")]
    block_count: u64,
    /// The store is encrypted; prompts for a password unless given
    #[structopt(short = "e", long = "encrypt")]
    encrypt: bool,
    /// Password for --encrypt
    #[structopt(short = "p", long = "password")]
    password: Option<String>,
}

fn main() -> Result<(), failure::Error> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("running with options {:?}", opt);

    let store = FileStore::open(&opt.data_path, opt.block_count, Consistency::VerifyJournal)?;

    if opt.encrypt {
        let password = opt
            .password
            .unwrap_or_else(|| rpassword::read_password_from_tty(Some("password: ")).unwrap());
        let salt = opt.data_path.to_string_lossy().into_owned();
        let (encr_key, mac_key) = derive_access_keys(&password, salt.as_bytes());
        let store = match CryptStore::init(store, &encr_key, &mac_key)? {
            Some(s) => s,
            None => {
                println!("Wrong password for {:?}.", opt.data_path);
                std::process::exit(1);
            }
        };
        check(Afs::new(store, CaseSensitivity::Insensitive))
    } else {
        check(Afs::new(store, CaseSensitivity::Insensitive))
    }
}

fn check<S: BlockStore>(fs: Afs<S>) -> Result<(), failure::Error> {
    fs.verify_free_list()?;
    let free_blocks = fs.free_space_blocks()?;
    let free_bytes = fs.free_space_bytes()?;
    let (result, _entries) = fs.crack_path("/")?;
    println!("free list: consistent");
    println!("root: {:?}", result);
    println!("free space: {} blocks ({} bytes)", free_blocks, free_bytes);
    Ok(())
}
