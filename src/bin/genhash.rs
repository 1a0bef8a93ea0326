use pullcord::cli::parse_genhash_args;
use pullcord::password::Pbkdf2Hash;
use pullcord::security::OsEntropy;
use std::io::BufRead;

fn main() -> anyhow::Result<()> {
    let matches = parse_genhash_args(std::env::args_os()).unwrap_or_else(|e| e.exit());

    let iterations = matches
        .get_one::<u16>("iterations")
        .copied()
        .unwrap_or(pullcord::password::MINIMUM_ITERATIONS);

    let password = match matches.get_one::<String>("password").filter(|p| !p.is_empty()) {
        Some(password) => password.clone(),
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    let hash = Pbkdf2Hash::new(&password, iterations, &OsEntropy)?;
    println!("{}", serde_json::to_string(&hash)?);
    Ok(())
}
