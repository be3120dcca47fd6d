fn main() {
    if let Err(err) = coha_survey_lib::run() {
        eprintln!("coha-survey: {err:#}");
        std::process::exit(1);
    }
}
