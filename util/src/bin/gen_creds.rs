use clap::{App, Arg};
use ion::credentials::{Credentials, KEY_SIZE};
use ion::crypto;
use ion::encoding::hex;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;

fn main() {
    let matches = App::new("Credentials Generator")
        .version("1.0")
        .author("Lattice Works")
        .about("Generates credentials file entries with fresh random keys.")
        .arg(
            Arg::with_name("NAME")
                .help("Principal name for the new entry")
                .required(true),
        )
        .arg(
            Arg::with_name("FILE")
                .help("Path to the credentials file")
                .required(true),
        )
        .arg(
            Arg::with_name("append")
                .long("append")
                .help("Append to an existing node credentials file"),
        )
        .get_matches();

    let name = matches.value_of("NAME").unwrap();
    let path = matches.value_of("FILE").unwrap();
    let append = matches.is_present("append");

    if append {
        let existing = fs::read_to_string(path).expect("Error reading credentials file");
        let parsed = Credentials::parse(&existing).expect("Existing credentials file is invalid");

        if parsed.key(name).is_some() {
            panic!("Entry {:?} already exists in {}", name, path);
        }
    }

    let mut key = [0u8; KEY_SIZE];
    crypto::random_bytes(&mut key);

    let entry = format!("{}:{}\n", name, hex::encode(&key));

    // Validate the entry the same way consumers will parse it.
    Credentials::parse(&entry).expect("Generated entry failed validation");

    let mut file = OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(path)
        .expect("Error opening credentials file");

    file.write_all(entry.as_bytes()).expect("Error writing credentials file");

    println!("Wrote entry for {:?} to {}", name, path);
}
