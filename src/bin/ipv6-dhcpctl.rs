//! Remote control client for the IPv6 DHCP server.

fn main() {
    std::process::exit(daemon::control::client::run(std::env::args_os()));
}
