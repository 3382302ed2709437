use crate::args::Args;

pub(super) fn init(args: &Args) {
    env_logger::Builder::new().parse_filters(&args.log_level.filter()).init();
}
