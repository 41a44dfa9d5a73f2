use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use fastevtx::{EvtxFilter, EvtxParser, OutputFormat, ParserSettings, Ranges};
use log::{Level, warn};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

struct EvtxCat {
    parser_settings: ParserSettings,
    input: PathBuf,
    output: Box<dyn Write>,
    filter: EvtxFilter,
    verbosity_level: Option<Level>,
}

impl EvtxCat {
    fn from_cli_matches(matches: &ArgMatches) -> Result<Self> {
        let input = PathBuf::from(
            matches
                .get_one::<String>("INPUT")
                .expect("This is a required argument"),
        );

        let output_format = match matches
            .get_one::<String>("output-format")
            .expect("has default")
            .as_str()
        {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Xml,
        };

        let num_threads: u32 = *matches.get_one("num-threads").expect("has default");
        let num_threads = match (cfg!(feature = "multithreading"), num_threads) {
            (true, number) => number,
            (false, _) => {
                eprintln!(
                    "requested threads, but the binary was compiled without the \
                     `multithreading` feature; parsing sequentially"
                );
                1
            }
        };

        let verbosity_level = match matches.get_count("verbose") {
            0 => None,
            1 => Some(Level::Info),
            2 => Some(Level::Debug),
            3 => Some(Level::Trace),
            _ => {
                eprintln!("using more than -vvv does not affect verbosity level");
                Some(Level::Trace)
            }
        };

        let output: Box<dyn Write> = if let Some(path) = matches.get_one::<String>("output-target")
        {
            let file = fs::File::create(path).with_context(|| {
                format!("An error occurred while creating output file at `{path}`")
            })?;
            Box::new(BufWriter::new(file))
        } else {
            Box::new(BufWriter::new(io::stdout()))
        };

        let filter = match matches.get_one::<String>("event-ranges") {
            Some(spec) => {
                let ranges: Ranges = spec
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid --event-ranges: {e}"))?;
                EvtxFilter::with_ranges(ranges)
            }
            None => EvtxFilter::empty(),
        };

        Ok(EvtxCat {
            parser_settings: ParserSettings::new()
                .num_threads(num_threads.try_into().expect("u32 -> usize"))
                .output_format(output_format)
                .separate_json_attributes(matches.get_flag("separate-json-attributes")),
            input,
            output,
            filter,
            verbosity_level,
        })
    }

    fn run(&mut self) -> Result<()> {
        if let Err(err) = self.try_to_initialize_logging() {
            eprintln!("{err:?}");
        }

        let buffer = fs::read(&self.input)
            .with_context(|| format!("Failed to read evtx file at: {}", self.input.display()))?;

        let parser = EvtxParser::from_buffer(&buffer)
            .with_context(|| format!("Failed to parse evtx file at: {}", self.input.display()))?
            .with_configuration(self.parser_settings.clone());

        let parsed = parser.parse();

        for warning in parsed.warnings() {
            warn!("{warning}");
        }

        for record in parsed.records().filter(|r| self.filter.matches(r)) {
            self.output.write_all(record.data.as_bytes())?;
            self.output.write_all(b"\n")?;
        }
        self.output.flush()?;

        Ok(())
    }

    fn try_to_initialize_logging(&self) -> Result<()> {
        if let Some(level) = self.verbosity_level {
            simplelog::WriteLogger::init(
                level.to_level_filter(),
                simplelog::Config::default(),
                io::stderr(),
            )
            .with_context(|| "Failed to initialize logging")?;
        }

        Ok(())
    }
}

fn main() -> Result<()> {
    let matches = Command::new("fastevtx")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Renders the records of an EVTX file as XML or JSON")
        .arg(Arg::new("INPUT").required(true).help("Input EVTX file path"))
        .arg(
            Arg::new("num-threads")
                .short('t')
                .long("threads")
                .default_value("0")
                .value_parser(clap::value_parser!(u32).range(0..))
                .help("Sets the number of worker threads, defaults to number of CPU cores."),
        )
        .arg(
            Arg::new("output-format")
                .short('o')
                .long("format")
                .value_parser(["json", "xml"])
                .default_value("xml")
                .help("Sets the output format"),
        )
        .arg(
            Arg::new("output-target")
                .long("output")
                .short('f')
                .action(ArgAction::Set)
                .help("Writes output to the file specified instead of stdout."),
        )
        .arg(
            Arg::new("event-ranges")
                .long("event-ranges")
                .short('r')
                .action(ArgAction::Set)
                .help(
                    "Only output records whose id falls in the given set of \
                     inclusive ranges, e.g. `1-100,205,1000-2000`.",
                ),
        )
        .arg(
            Arg::new("separate-json-attributes")
                .long("separate-json-attributes")
                .action(ArgAction::SetTrue)
                .help(
                    "When outputting JSON, stores attributes in a separate \
                     `<name>_attributes` object instead of `#attributes`.",
                ),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets debug prints level for the application."),
        )
        .get_matches();

    EvtxCat::from_cli_matches(&matches)?.run()
}
