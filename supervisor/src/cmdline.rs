use clap::{Arg, ArgAction, Command};

pub(super) fn root_cli() -> Command {
    Command::new("consumer-supervisor")
        .about("Supervises Kafka partition consumers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(run_subcmd())
}

fn run_subcmd() -> Command {
    Command::new("run")
        .about("Consumes one partition of each topic, logging the messages")
        .arg_required_else_help(true)
        .arg(
            Arg::new("topic")
                .long("topic")
                .help("Topic to consume, can be repeated")
                .required(true)
                .num_args(1..)
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("partition")
                .long("partition")
                .help("Partition read from every topic")
                .default_value("0")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(i32).range(0..)),
        )
        .arg(
            Arg::new("offsets-dir")
                .long("offsets-dir")
                .help("Directory where the last handled offset of each topic is kept")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
}
