mod helpers;
mod tests_compact;
mod tests_open;
mod tests_recovery;
mod tests_scan;
