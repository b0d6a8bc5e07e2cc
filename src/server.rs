//! The interactive request loop and its line protocol.
//!
//! Commands arrive newline-framed on standard input and answers go to
//! standard output, one self-contained response per command. A one-second
//! tick keeps the shared wall-clock current and a slow timer sweeps the
//! cache.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::calldata::Coordinates;
use crate::config::{SiteLocation, Settings};
use crate::formatter;
use crate::geo;
use crate::resolver::Resolver;
use crate::Result;

/// Wire protocol version, announced in the banner.
pub const PROTO_VERSION: u32 = 1;

/// A line longer than this is discarded rather than truncated silently.
const INPUT_BUFFER_SIZE: usize = 16 * 1024;

/// How often expired cache rows are swept.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 3600);

const GOODBYE_EXITING: &str = "+GOODBYE Hope you had a nice session! Exiting.\n";
const GOODBYE: &str = "+GOODBYE Hope you had a nice session!\n";

const HELP_TEXT: &str = "\
200 OK
*** HELP ***
/CALL <CALLSIGN> [NOCACHE]\tLookup a callsign
/EXIT\t\t\t\tShutdown the service
/GOODBYE\t\t\tDisconnect from the service, leaving it running
/GRID [GRID|COORD]\t\tGet information about a grid square or lat/lon
/HELP\t\t\t\tThis message
*** Planned ***
/GNIS <GRID|COORDS>\t\tLook up the place name for a grid or WGS-84 coordinate
+OK

";

/// What the connection should do once a response has been written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    /// Drop the client but keep the process running. On a stdio transport
    /// there is no separate connection, so this just keeps reading.
    DisconnectClient,
    ExitProcess,
}

/// Accumulates raw input and splits it into newline-framed commands.
pub struct LineFramer {
    buffer: Vec<u8>,
}

/// Lines extracted by one [`LineFramer::push`] call.
pub struct FramedLines {
    pub lines: Vec<String>,
    /// The buffer filled without a newline and was discarded.
    pub overflowed: bool,
}

impl LineFramer {
    pub fn new() -> LineFramer {
        LineFramer {
            buffer: Vec::with_capacity(INPUT_BUFFER_SIZE),
        }
    }

    /// Append `data`, returning every complete line it finishes. Each
    /// returned line has exactly one trailing newline consumed and never
    /// contains an interior newline.
    pub fn push(&mut self, data: &[u8]) -> FramedLines {
        let mut lines = Vec::new();
        let mut overflowed = false;
        for &byte in data {
            if byte == b'\n' {
                lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                self.buffer.clear();
            } else {
                if self.buffer.len() >= INPUT_BUFFER_SIZE {
                    overflowed = true;
                    self.buffer.clear();
                }
                self.buffer.push(byte);
            }
        }
        FramedLines { lines, overflowed }
    }
}

/// Digits after the decimal point in a coordinate string.
fn decimal_digits(s: &str) -> usize {
    match s.split_once('.') {
        Some((_, frac)) => frac.chars().take_while(|c| c.is_ascii_digit()).count(),
        None => 0,
    }
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// The wired-up service: resolver, operator location, and the shared
/// wall-clock refreshed by the periodic tick.
pub struct Service {
    settings: Settings,
    site: SiteLocation,
    resolver: Resolver,
    now: i64,
}

impl Service {
    pub fn new(settings: Settings, site: SiteLocation, resolver: Resolver) -> Service {
        Service {
            settings,
            site,
            resolver,
            now: unix_now(),
        }
    }

    /// The startup banner, emitted before any input is accepted.
    pub fn banner(&self) -> String {
        let on_off = |enabled: bool| if enabled { "On" } else { "Off" };
        let mut out = String::new();
        out.push_str(
            "+NOTICE This server is experimental. Please feel free to suggest improvements or send patches\n",
        );
        out.push_str("+NOTICE Use /HELP to see available commands.\n");
        out.push_str(&format!("+PROTO {} mytime={}\n", PROTO_VERSION, self.now));
        out.push_str(&format!(
            "+OK {}/{} ready to answer requests. QRZ: {}{}, ULS: {}, GNIS: {}, Cache: {}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            on_off(self.settings.use_qrz),
            if self.resolver.offline() { " (offline)" } else { "" },
            on_off(self.settings.use_uls),
            on_off(self.settings.use_gnis),
            on_off(self.settings.use_cache),
        ));
        out
    }

    /// Sweep expired cache rows. Run once before accepting input.
    pub async fn startup_sweep(&self) {
        if let Some(cache) = self.resolver.cache() {
            cache.expire(self.now).await;
        }
    }

    /// Resolve one callsign and render the full response for it.
    async fn lookup_response(&mut self, callsign: &str, use_cache: bool) -> Result<String> {
        match self.resolver.lookup(callsign, self.now, use_cache).await {
            Some(record) => formatter::render_record(&record, &self.site, self.now),
            None => {
                info!("Callsign {} was not found in enabled databases.", callsign);
                Ok(formatter::not_found_line(
                    callsign,
                    self.resolver.offline(),
                    self.now,
                ))
            }
        }
    }

    /// Parse and execute a single command line.
    pub async fn handle_line(&mut self, line: &str) -> Result<(String, Flow)> {
        if line.is_empty() {
            return Ok((String::new(), Flow::Continue));
        }

        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or("").to_ascii_uppercase();
        let rest = parts.next().unwrap_or("").trim();

        match command.as_str() {
            "/HELP" => Ok((HELP_TEXT.to_owned(), Flow::Continue)),
            "/CALL" => {
                let mut args = rest.split_whitespace();
                let callsign = match args.next() {
                    Some(callsign) => callsign.to_owned(),
                    None => {
                        return Ok((
                            "+ERROR You must specify a callsign to look up.\n".to_owned(),
                            Flow::Continue,
                        ))
                    }
                };
                let use_cache = !args.any(|arg| arg.eq_ignore_ascii_case("NOCACHE"));
                let response = self.lookup_response(&callsign, use_cache).await?;
                Ok((response, Flow::Continue))
            }
            "/GRID" => Ok((self.grid_command(rest), Flow::Continue)),
            "/GNIS" => {
                if rest.is_empty() {
                    Ok((
                        "You must specify a WGS-84 coordinate or a 4-10 digit grid square.\n"
                            .to_owned(),
                        Flow::Continue,
                    ))
                } else {
                    Ok((
                        "+ERROR GNIS lookups are not implemented yet.\n".to_owned(),
                        Flow::Continue,
                    ))
                }
            }
            "/EXIT" => {
                error!("Got EXIT from client. Goodbye!");
                Ok((GOODBYE_EXITING.to_owned(), Flow::ExitProcess))
            }
            "/GOODBYE" => {
                info!("Got GOODBYE from client. Disconnecting it.");
                Ok((GOODBYE.to_owned(), Flow::DisconnectClient))
            }
            _ => Ok((
                "400 Bad Request - Your client sent a request I do not understand... Try /HELP for commands!\n"
                    .to_owned(),
                Flow::Continue,
            )),
        }
    }

    /// `/GRID <locator>` or `/GRID <lat>,<lon>`: convert both ways and add
    /// the heading from the operator's home location.
    fn grid_command(&self, rest: &str) -> String {
        let point = rest.trim();
        if point.is_empty() {
            return "You must specify a WGS-84 coordinate or a 4-10 digit grid square.\n"
                .to_owned();
        }

        let (grid, coords) = if let Some((lat_text, lon_text)) = point.split_once(',') {
            let lat_text = lat_text.trim();
            let lon_text = lon_text.trim();
            let lat_digits = decimal_digits(lat_text);
            let lon_digits = decimal_digits(lon_text);
            if lat_digits == 0 || lon_digits == 0 {
                return "+ERROR You must specify at least one decimal place for each coordinate\n"
                    .to_owned();
            }
            let (latitude, longitude) = match (lat_text.parse(), lon_text.parse()) {
                (Ok(lat), Ok(lon)) => (lat, lon),
                _ => return format!("+ERROR Invalid WGS-84 coordinate '{}'\n", point),
            };
            // Echo back as many decimals as the request carried, within
            // reason.
            let precision = match lat_digits.min(lon_digits) {
                1 => 3,
                2 => 4,
                _ => 5,
            };
            let coords = Coordinates {
                latitude,
                longitude,
                precision,
            };
            (geo::latlon_to_maidenhead(&coords), coords)
        } else {
            if point.len() > 10 {
                return format!("+ERROR Invalid grid square '{}' (over 10 characters)\n", point);
            }
            let locator = point.to_ascii_uppercase();
            match geo::maidenhead_to_latlon(&locator) {
                Some(coords) => (locator, coords),
                None => {
                    return format!(
                        "+ERROR Invalid grid square '{}' (must be 4-10 characters, even length)\n",
                        point
                    )
                }
            }
        };

        let mut out = String::new();
        out.push_str(&format!("Grid: {}\n", grid));
        let precision = usize::from(coords.precision);
        out.push_str(&format!(
            "WGS-84: {:.prec$}, {:.prec$}\n",
            coords.latitude,
            coords.longitude,
            prec = precision
        ));
        if let Some(my) = &self.site.coords {
            let distance = geo::distance_km(
                my.latitude,
                my.longitude,
                coords.latitude,
                coords.longitude,
            );
            let bearing = geo::bearing(
                my.latitude,
                my.longitude,
                coords.latitude,
                coords.longitude,
            );
            out.push_str(&format!(
                "Heading: {:.1} mi / {:.1} km at {:.0} degrees\n",
                distance * 0.6214,
                distance,
                bearing
            ));
        }
        out.push_str("+EOR\n\n");
        out
    }

    /// Look up each argv callsign in order, then say goodbye and exit.
    pub async fn run_batch(&mut self, callsigns: &[String]) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        for callsign in callsigns {
            let response = self.lookup_response(callsign, true).await?;
            stdout.write_all(response.as_bytes()).await?;
            stdout.flush().await?;
            if self.resolver.exit_requested() {
                break;
            }
        }
        stdout.write_all(GOODBYE_EXITING.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    /// The cooperative event loop: framed commands from stdin, a 1-second
    /// clock tick, and the periodic cache sweep. EOF acts as `/EXIT`.
    pub async fn run_interactive(&mut self) -> Result<()> {
        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut framer = LineFramer::new();
        let mut read_buf = vec![0u8; 4096];

        let mut clock_tick = time::interval(Duration::from_secs(1));
        clock_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cache_sweep = time::interval_at(
            Instant::now() + CACHE_SWEEP_INTERVAL,
            CACHE_SWEEP_INTERVAL,
        );
        cache_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                read = stdin.read(&mut read_buf) => {
                    let bytes_read = read.context("error reading from stdin")?;
                    if bytes_read == 0 {
                        error!("got EOF on input, exiting!");
                        stdout.write_all(GOODBYE_EXITING.as_bytes()).await?;
                        stdout.flush().await?;
                        return Ok(());
                    }
                    let framed = framer.push(&read_buf[..bytes_read]);
                    if framed.overflowed {
                        stdout
                            .write_all(b"+ERROR Input buffer full, discarding incomplete line\n")
                            .await?;
                    }
                    for line in framed.lines {
                        let (response, flow) = self.handle_line(&line).await?;
                        stdout.write_all(response.as_bytes()).await?;
                        stdout.flush().await?;
                        if flow == Flow::ExitProcess || self.resolver.exit_requested() {
                            return Ok(());
                        }
                    }
                }
                _ = clock_tick.tick() => {
                    self.now = unix_now();
                }
                _ = cache_sweep.tick() => {
                    if let Some(cache) = self.resolver.cache() {
                        cache.expire(self.now).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calldata::Coordinates;

    fn test_service() -> Service {
        let settings = Settings {
            use_uls: false,
            use_qrz: false,
            use_cache: false,
            use_gnis: false,
            cache_db: None,
            uls_db: None,
            cache_expiry: 86400,
            keep_stale_if_offline: true,
            max_requests: 0,
            retry_delay: 60,
        };
        let site = SiteLocation {
            grid: Some("EM48".to_owned()),
            coords: Some(Coordinates::new(38.5, -90.0)),
        };
        let resolver = Resolver::new(None, Vec::new(), 60, 0);
        Service::new(settings, site, resolver)
    }

    #[test]
    fn framer_splits_lines() {
        let mut framer = LineFramer::new();
        let framed = framer.push(b"/HELP\n/CALL W1AW\n");
        assert_eq!(framed.lines, vec!["/HELP", "/CALL W1AW"]);
        assert!(!framed.overflowed);
    }

    #[test]
    fn framer_reassembles_partial_reads() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"/CALL W").lines.is_empty());
        let framed = framer.push(b"1AW\n");
        assert_eq!(framed.lines, vec!["/CALL W1AW"]);
    }

    #[test]
    fn framer_consumes_one_newline_per_line() {
        let mut framer = LineFramer::new();
        let framed = framer.push(b"\n\na\n");
        assert_eq!(framed.lines, vec!["", "", "a"]);
        for line in &framed.lines {
            assert!(!line.contains('\n'));
        }
    }

    #[test]
    fn framer_discards_oversized_lines() {
        let mut framer = LineFramer::new();
        let big = vec![b'x'; INPUT_BUFFER_SIZE + 10];
        let framed = framer.push(&big);
        assert!(framed.lines.is_empty());
        assert!(framed.overflowed);
        // The stream recovers on the next newline.
        let framed = framer.push(b"tail\n");
        assert_eq!(framed.lines.len(), 1);
    }

    #[tokio::test]
    async fn empty_line_is_a_no_op() {
        let mut service = test_service();
        let (response, flow) = service.handle_line("").await.unwrap();
        assert_eq!(response, "");
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn help_ends_with_ok() {
        let mut service = test_service();
        let (response, flow) = service.handle_line("/help").await.unwrap();
        assert!(response.starts_with("200 OK\n"));
        assert!(response.contains("*** HELP ***"));
        assert!(response.ends_with("+OK\n\n"));
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn unknown_command_is_a_bad_request() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/BOGUS").await.unwrap();
        assert!(response.starts_with("400 Bad Request"));
    }

    #[tokio::test]
    async fn exit_and_goodbye_flows() {
        let mut service = test_service();
        let (response, flow) = service.handle_line("/EXIT").await.unwrap();
        assert!(response.starts_with("+GOODBYE"));
        assert_eq!(flow, Flow::ExitProcess);

        let (response, flow) = service.handle_line("/goodbye").await.unwrap();
        assert!(response.starts_with("+GOODBYE"));
        assert_eq!(flow, Flow::DisconnectClient);
    }

    #[tokio::test]
    async fn call_with_no_sources_is_not_found() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/CALL W1AW").await.unwrap();
        assert!(response.starts_with("404 NOT FOUND W1AW OFFLINE "));
    }

    #[tokio::test]
    async fn call_without_a_callsign_is_an_error() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/CALL").await.unwrap();
        assert!(response.starts_with("+ERROR"));
    }

    #[tokio::test]
    async fn grid_locator_conversion() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/GRID FN31pr").await.unwrap();
        assert!(response.contains("Grid: FN31PR\n"));
        assert!(response.contains("WGS-84: 41.7292, -72.7083\n"));
        assert!(response.contains("Heading: "));
        assert!(response.ends_with("+EOR\n\n"));
    }

    #[tokio::test]
    async fn grid_coordinate_round_trip() {
        let mut service = test_service();
        let (response, _) = service
            .handle_line("/GRID 41.7292, -72.7081")
            .await
            .unwrap();
        assert!(response.contains("Grid: FN31PR\n"));
        assert!(response.contains("WGS-84: 41.72920, -72.70810\n"));
    }

    #[tokio::test]
    async fn grid_rejects_garbage() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/GRID FN3").await.unwrap();
        assert!(response.starts_with("+ERROR Invalid grid square"));

        let (response, _) = service.handle_line("/GRID 41, -72").await.unwrap();
        assert!(response.starts_with("+ERROR You must specify at least one decimal place"));

        let (response, _) = service.handle_line("/GRID").await.unwrap();
        assert!(response.starts_with("You must specify"));
    }

    #[tokio::test]
    async fn gnis_is_reserved() {
        let mut service = test_service();
        let (response, _) = service.handle_line("/GNIS FN31").await.unwrap();
        assert!(response.contains("not implemented"));
        let (response, _) = service.handle_line("/GNIS").await.unwrap();
        assert!(response.starts_with("You must specify"));
    }

    #[tokio::test]
    async fn banner_reports_source_state() {
        let service = test_service();
        let banner = service.banner();
        assert!(banner.starts_with("+NOTICE"));
        assert!(banner.contains(&format!("+PROTO {} mytime=", PROTO_VERSION)));
        assert!(banner.contains("QRZ: Off (offline), ULS: Off, GNIS: Off, Cache: Off"));
    }
}
