use logmend::core::error::MendError;

fn main() {
    match logmend::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("logmend: {}", e);
            if let MendError::StoreUnavailable(_) = e {
                eprintln!("hint: set backend=file-atomic (or LOGMEND_BACKEND=file-atomic) to proceed locally");
            }
            std::process::exit(e.exit_code());
        }
    }
}
