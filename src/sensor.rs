// The sensor session: SCIP 2.0 handshake, parameter retrieval, the
// measurement streaming engine and the public lifecycle api.
use crate::config::*;
use crate::transport::Wire;
use crate::{Error, UrgResult, crc, scip};
use log::{debug, warn};
use std::time::Duration;

const MAX_READ_TIMES: usize = 3;

/// What a received frame turned out to be once its echoback was parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Measurement(MeasurementType),
    Stop,
    Unknown,
}

/// Outcome of one measurement reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    /// A data frame carrying this many steps.
    Data(usize),
    /// The echo of a `QT`: the stream has been terminated.
    Stopped,
}

/// An open session with one URG sensor.
///
/// All methods take `&mut self`: a session is owned by exactly one actor
/// and issues at most one command at a time. Decoded samples go into
/// caller-provided slices; the session allocates nothing per frame.
#[derive(Debug)]
pub struct Urg {
    /// Type-erased connection; serial and ethernet behave the same above
    /// the line level.
    conn: Box<dyn Wire>,

    // Intrinsics retrieved with PP.
    min_distance: u32,
    max_distance: u32,
    area_resolution: u32,
    first_data_index: i32,
    last_data_index: i32,
    front_data_index: i32,
    scan_usec: u32,

    /// Line-read timeout derived from the scan period.
    timeout: Duration,

    // Scanning window for the next measurement request.
    scanning_first_step: i32,
    scanning_last_step: i32,
    scanning_skip_step: i32,
    scanning_skip_scan: u8,

    /// Requested sample width for plain distance measurement.
    range_data_byte: RangeDataByte,

    // Mirrors of the last measurement echoback.
    received_range_data_byte: RangeDataByte,
    received_first_index: i32,
    received_last_index: i32,
    received_skip_step: i32,

    // Stream state.
    specified_scan_times: u32,
    remaining_scan_times: u32,
    is_active: bool,
    is_sending: bool,
    is_laser_on: bool,
    safety_mode: bool,

    last_errno: i32,
}

// ======= Internal API =======
impl Urg {
    pub(crate) fn open_with(
        conn: Box<dyn Wire>,
        kind: ConnectionKind,
        baudrate: u32,
    ) -> UrgResult<Self> {
        let mut urg = Urg {
            conn,
            min_distance: 0,
            max_distance: 0,
            area_resolution: 1,
            first_data_index: 0,
            last_data_index: 0,
            front_data_index: 0,
            scan_usec: 0,
            timeout: PROBE_TIMEOUT,
            scanning_first_step: 0,
            scanning_last_step: 0,
            scanning_skip_step: 1,
            scanning_skip_scan: 0,
            range_data_byte: RangeDataByte::Three,
            received_range_data_byte: RangeDataByte::Three,
            received_first_index: 0,
            received_last_index: 0,
            received_skip_step: 1,
            specified_scan_times: 0,
            remaining_scan_times: 0,
            is_active: false,
            // The sensor may be mid-stream from a previous session.
            is_sending: true,
            is_laser_on: false,
            safety_mode: false,
            last_errno: 0,
        };

        if kind == ConnectionKind::Serial {
            urg.connect_serial_device(baudrate)?;
        }
        urg.receive_parameter()?;
        urg.is_active = true;
        Ok(urg)
    }

    /// Stores the numeric code of `error` and hands it back to the caller.
    fn fail<T>(&mut self, error: Error) -> UrgResult<T> {
        self.last_errno = error.code();
        Err(error)
    }

    /// Reads one line, flattening hard transport failures into "nothing
    /// arrived". A dead transport makes the session inactive, so the
    /// call after the failing one reports `NotConnected`.
    fn next_line(&mut self, buf: &mut [u8], timeout: Duration) -> Option<usize> {
        match self.conn.read_line(buf, timeout) {
            Ok(n) => n,
            Err(e) => {
                warn!("transport failure: {e}");
                self.is_active = false;
                None
            }
        }
    }

    /// Sends `command` and consumes its response up to the terminating
    /// blank line. Lines after the echoback are checksum-verified and,
    /// when `capture` is given, collected for the caller. The status
    /// line must carry one of the `expected` codes. Returns the number
    /// of lines that followed the echoback.
    fn scip_response(
        &mut self,
        command: &str,
        expected: &[i32],
        timeout: Duration,
        mut capture: Option<&mut Vec<String>>,
    ) -> UrgResult<usize> {
        let written = self.conn.send(command.as_bytes()).unwrap_or(0);
        self.is_sending = true;
        if written != command.len() {
            return self.fail(Error::Send);
        }

        let mut buffer = [0u8; BUFFER_SIZE];
        let mut line_number = 0usize;
        let mut status_ok = false;
        loop {
            let Some(n) = self.next_line(&mut buffer, timeout) else {
                return self.fail(Error::NoResponse);
            };
            let line = &buffer[..n];

            // Captured before validation: the baudrate probe inspects the
            // status line even when the probe itself fails.
            if line_number > 0 {
                if let Some(capture) = capture.as_deref_mut() {
                    capture.push(String::from_utf8_lossy(line).into_owned());
                }
            }

            if line_number == 0 {
                let echo = &command.as_bytes()[..command.len() - 1];
                if n < echo.len() || &line[..echo.len()] != echo {
                    return self.fail(Error::InvalidResponse);
                }
            } else if n > 0 {
                // Lines that pack a delimiter between payload and checksum
                // are also accepted with the shorter sum.
                let ck = line[n - 1];
                if ck != scip::checksum(&line[..n - 1])
                    && ck != scip::checksum(&line[..n.saturating_sub(2)])
                {
                    return self.fail(Error::Checksum);
                }
            }

            if line_number == 1 {
                if n == 1 {
                    // Single-character status: a SCIP 1.1 sensor answered.
                    status_ok = true;
                } else if n != 3 {
                    return self.fail(Error::InvalidResponse);
                } else if expected.contains(&scip::parse_decimal(line)) {
                    status_ok = true;
                }
            }

            line_number += 1;
            if n == 0 {
                break;
            }
        }

        if !status_ok {
            return self.fail(Error::Unknown);
        }
        Ok(line_number - 1)
    }

    /// Tells the sensor to stop and reads until it goes quiet, so the
    /// next command starts from a clean line.
    fn ignore_receive_data(&mut self, timeout: Duration) {
        if !self.is_sending {
            return;
        }
        debug!("draining sensor output");
        let _ = self.conn.send(b"QT\n");
        self.is_laser_on = false;
        let mut buffer = [0u8; BUFFER_SIZE];
        while let Ok(Some(_)) = self.conn.read_line(&mut buffer, timeout) {}
        self.is_sending = false;
    }

    /// Moves the sensor to `target` bps with SS, then follows with the
    /// local port.
    fn change_sensor_baudrate(&mut self, target: u32, current: u32) -> UrgResult<()> {
        if current == target {
            self.last_errno = 0;
            return Ok(());
        }
        debug!("moving sensor baudrate {current} -> {target}");
        let command = format!("SS{target:06}\n");
        // 03: already at that rate, 04: rate not settable over this link.
        match self.scip_response(&command, &[0, 3, 4], self.timeout, None) {
            Ok(n) if n > 0 => {}
            _ => return self.fail(Error::InvalidParameter),
        }
        self.conn.set_baudrate(target)?;
        self.last_errno = 0;
        Ok(())
    }

    /// Finds the rate the sensor currently listens on and leaves it idle,
    /// speaking SCIP 2.0, at the requested rate.
    fn connect_serial_device(&mut self, baudrate: u32) -> UrgResult<()> {
        let mut try_baudrates = TRY_BAUDRATES;
        if let Some(pos) = try_baudrates.iter().position(|b| *b == baudrate) {
            try_baudrates.swap(0, pos);
        }

        for candidate in try_baudrates {
            debug!("probing sensor at {candidate} [bps]");
            let _ = self.conn.set_baudrate(candidate);

            let mut capture = Vec::new();
            let result = self.scip_response("QT\n", &[0], PROBE_TIMEOUT, Some(&mut capture));
            let first = capture.first().map(String::as_str).unwrap_or("");

            if first == "E" {
                // SCIP 1.1 error status: switch the protocol first.
                debug!("sensor speaks SCIP 1.1, upgrading");
                let _ = self.scip_response("SCIP2.0\n", &[0], PROBE_TIMEOUT, None);
                self.ignore_receive_data(PROBE_TIMEOUT);
                return self.change_sensor_baudrate(baudrate, candidate);
            } else if first == "0Ee" {
                // Left in time-stamp adjustment mode by a previous session.
                debug!("sensor is in time-stamp mode, leaving it");
                let _ = self.scip_response("TM2\n", &[0], PROBE_TIMEOUT, None);
                self.ignore_receive_data(PROBE_TIMEOUT);
                return self.change_sensor_baudrate(baudrate, candidate);
            }

            match result {
                Err(Error::InvalidResponse) => {
                    // The echoback was a data line: a stream is running.
                    self.ignore_receive_data(PROBE_TIMEOUT);
                    return self.change_sensor_baudrate(baudrate, candidate);
                }
                Ok(_) if first == "00P" => {
                    return self.change_sensor_baudrate(baudrate, candidate);
                }
                _ => continue,
            }
        }
        self.fail(Error::BaudrateNotDetected)
    }

    /// Retrieves the sensor intrinsics with PP and initializes the
    /// scanning window to the full measurable range.
    fn receive_parameter(&mut self) -> UrgResult<()> {
        let mut capture = Vec::new();
        let ret = self.scip_response("PP\n", &[0], PROBE_TIMEOUT, Some(&mut capture))?;
        if ret < PP_RESPONSE_LINES {
            self.ignore_receive_data(PROBE_TIMEOUT);
            return self.fail(Error::InvalidResponse);
        }

        let mut received_bits = 0u16;
        for line in capture.iter().take(ret - 1) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.as_bytes();
            match key {
                "DMIN" => {
                    self.min_distance = scip::parse_decimal(value) as u32;
                    received_bits |= 0x0001;
                }
                "DMAX" => {
                    self.max_distance = scip::parse_decimal(value) as u32;
                    received_bits |= 0x0002;
                }
                "ARES" => {
                    self.area_resolution = scip::parse_decimal(value).max(1) as u32;
                    received_bits |= 0x0004;
                }
                "AMIN" => {
                    self.first_data_index = scip::parse_decimal(value);
                    received_bits |= 0x0008;
                }
                "AMAX" => {
                    self.last_data_index = scip::parse_decimal(value);
                    received_bits |= 0x0010;
                }
                "AFRT" => {
                    self.front_data_index = scip::parse_decimal(value);
                    received_bits |= 0x0020;
                }
                "SCAN" => {
                    let rpm = scip::parse_decimal(value).max(1);
                    self.scan_usec = (60 * 1000 * 1000 / rpm) as u32;
                    self.timeout = derived_timeout(self.scan_usec);
                    received_bits |= 0x0040;
                }
                _ => {}
            }
        }

        if received_bits != 0x007f {
            return self.fail(Error::Receive);
        }

        self.set_scanning_parameter(
            self.first_data_index - self.front_data_index,
            self.last_data_index - self.front_data_index,
            1,
        )?;
        self.last_errno = 0;
        Ok(())
    }

    fn parse_distance_parameter(&mut self, echoback: &[u8]) -> FrameKind {
        self.received_range_data_byte = RangeDataByte::Three;
        let kind = match (echoback[0], echoback[1]) {
            (_, b'S') => {
                self.received_range_data_byte = RangeDataByte::Two;
                FrameKind::Measurement(MeasurementType::Distance)
            }
            (b'G' | b'M', b'D') => FrameKind::Measurement(MeasurementType::Distance),
            (b'H' | b'N', b'D') => FrameKind::Measurement(MeasurementType::Multiecho),
            (b'G' | b'M', b'E') => FrameKind::Measurement(MeasurementType::DistanceIntensity),
            (b'H' | b'N', b'E') => FrameKind::Measurement(MeasurementType::MultiechoIntensity),
            _ => return FrameKind::Unknown,
        };

        self.received_first_index = scip::parse_decimal(&echoback[2..6]);
        self.received_last_index = scip::parse_decimal(&echoback[6..10]);
        self.received_skip_step = scip::parse_decimal(&echoback[10..12]);
        kind
    }

    fn parse_distance_echoback(&mut self, echoback: &[u8]) -> FrameKind {
        if echoback == b"QT" {
            return FrameKind::Stop;
        }
        match (echoback.len(), echoback.first()) {
            (12, Some(b'G' | b'H')) | (15, Some(b'M' | b'N')) => {
                self.parse_distance_parameter(echoback)
            }
            _ => FrameKind::Unknown,
        }
    }

    /// Reads one measurement reply: echoback, status, timestamp and data
    /// lines. Continuous mode acknowledges the request with a `00` frame
    /// before the first data frame; that frame is consumed here and the
    /// data frame behind it fetched transparently.
    fn receive_data(
        &mut self,
        length: Option<&mut [u32]>,
        intensity: Option<&mut [u16]>,
        time_stamp: Option<&mut u32>,
        safety: Option<&mut SafetyData>,
    ) -> UrgResult<Reply> {
        let mut buffer = [0u8; BUFFER_SIZE];

        // Scans skipped by the sensor stretch the wait for the first line.
        let extended = self.timeout
            + Duration::from_micros(self.scan_usec as u64 * self.scanning_skip_scan as u64);
        let kind = match self.next_line(&mut buffer, extended) {
            Some(n) if n > 0 => self.parse_distance_echoback(&buffer[..n]),
            _ => return self.fail(Error::NoResponse),
        };

        if self.next_line(&mut buffer, self.timeout) != Some(3) {
            self.ignore_receive_data(self.timeout);
            return self.fail(Error::InvalidResponse);
        }
        if buffer[2] != scip::checksum(&buffer[..2]) {
            self.ignore_receive_data(self.timeout);
            return self.fail(Error::Checksum);
        }
        let status = [buffer[0], buffer[1]];

        if kind == FrameKind::Stop {
            // QT acknowledgement: status plus the closing blank line.
            if matches!(self.next_line(&mut buffer, self.timeout), Some(n) if n > 0) {
                self.ignore_receive_data(self.timeout);
                return self.fail(Error::InvalidResponse);
            }
            return Ok(Reply::Stopped);
        }

        if self.specified_scan_times != 1 && status == *b"00" {
            // The acknowledgement frame of a continuous request. Consume
            // its blank line and return the data frame that follows.
            if self.next_line(&mut buffer, self.timeout) != Some(0) {
                self.ignore_receive_data(self.timeout);
                return self.fail(Error::InvalidResponse);
            }
            return self.receive_data(length, intensity, time_stamp, safety);
        }

        let expected: &[u8; 2] = if self.specified_scan_times == 1 {
            b"00"
        } else {
            b"99"
        };
        if status != *expected {
            self.ignore_receive_data(self.timeout);
            return self.fail(Error::InvalidResponse);
        }

        if let Some(n) = self.next_line(&mut buffer, self.timeout) {
            if n >= 4 {
                if let Some(time_stamp) = time_stamp {
                    *time_stamp = scip::decode(&buffer[..4]);
                }
            }
        }

        let reply = match kind {
            FrameKind::Measurement(kind) => {
                Reply::Data(self.receive_length_data(length, intensity, kind, safety)?)
            }
            FrameKind::Stop | FrameKind::Unknown => Reply::Data(0),
        };

        if self.specified_scan_times > 0 && self.remaining_scan_times > 0 {
            self.remaining_scan_times -= 1;
            if self.remaining_scan_times == 0 {
                // Requested scans consumed: tell the sensor to stop. The
                // acknowledgement is picked up by the next stop call.
                let _ = self.conn.send(b"QT\n");
                self.is_laser_on = false;
            }
        }
        Ok(reply)
    }

    /// Decodes the data lines of one frame. Lines are concatenated with
    /// their checksums stripped; complete samples are consumed as soon as
    /// the buffer holds them and the tail carries over to the next line.
    fn receive_length_data(
        &mut self,
        mut length: Option<&mut [u32]>,
        mut intensity: Option<&mut [u16]>,
        kind: MeasurementType,
        mut safety: Option<&mut SafetyData>,
    ) -> UrgResult<usize> {
        let each_size = self.received_range_data_byte.size();
        let data_size = if kind.is_intensity() {
            each_size * 2
        } else {
            each_size
        };
        let echo_slots = if kind.is_multiecho() { MAX_ECHO } else { 1 };
        let span = (self.received_last_index - self.received_first_index).max(0);
        let expected_steps = span / self.received_skip_step.max(1) + 1;

        let mut buffer = [0u8; BUFFER_SIZE];
        let mut line_filled = 0usize;
        let mut step_filled = 0i32;
        let mut echo_index = 0usize;

        loop {
            let n = self.next_line(&mut buffer[line_filled..], self.timeout);
            if let Some(n) = n.filter(|n| *n > 0) {
                let ck = buffer[line_filled + n - 1];
                if ck != scip::checksum(&buffer[line_filled..line_filled + n - 1]) {
                    self.ignore_receive_data(self.timeout);
                    return self.fail(Error::Checksum);
                }
                if safety.is_some()
                    && self.safety_mode
                    && step_filled == expected_steps
                    && line_filled == 0
                {
                    // All steps of the frame are in: this line is the
                    // safety auxiliary block, not sample data.
                    self.decode_safety_block(&buffer[..n - 1], safety.as_deref_mut());
                    continue;
                }
                line_filled += n - 1;
            }

            let end = line_filled;
            let mut pos = 0usize;
            while end - pos >= data_size {
                if buffer[pos] == b'&' {
                    // An additional echo of the step before this one.
                    step_filled -= 1;
                    echo_index += 1;
                    pos += 1;
                    if end - pos < data_size {
                        break;
                    }
                } else {
                    echo_index = 0;
                }

                if step_filled < 0 || step_filled > span {
                    self.ignore_receive_data(self.timeout);
                    return self.fail(Error::Receive);
                }

                let base = step_filled as usize * echo_slots;
                let slot_ok = echo_index < echo_slots;
                if slot_ok {
                    if let Some(out) = length.as_deref_mut() {
                        if base + echo_slots > out.len() {
                            self.ignore_receive_data(self.timeout);
                            return self.fail(Error::Receive);
                        }
                        if echo_slots > 1 && echo_index == 0 {
                            out[base + 1..base + echo_slots].fill(0);
                        }
                        out[base + echo_index] = scip::decode(&buffer[pos..pos + each_size]);
                    }
                }
                pos += each_size;

                if kind.is_intensity() {
                    if slot_ok {
                        if let Some(out) = intensity.as_deref_mut() {
                            if base + echo_slots > out.len() {
                                self.ignore_receive_data(self.timeout);
                                return self.fail(Error::Receive);
                            }
                            if echo_slots > 1 && echo_index == 0 {
                                out[base + 1..base + echo_slots].fill(0);
                            }
                            out[base + echo_index] =
                                scip::decode(&buffer[pos..pos + each_size]) as u16;
                        }
                    }
                    pos += each_size;
                }

                step_filled += 1;
            }

            // Keep the bytes of a sample split across lines.
            buffer.copy_within(pos..end, 0);
            line_filled = end - pos;

            if n.filter(|n| *n > 0).is_none() {
                break;
            }
        }

        Ok(step_filled.max(0) as usize)
    }

    /// Auxiliary block of a safety-mode frame: a six-bit-packed OSSD word
    /// followed by four hex characters of CRC over the word's characters.
    fn decode_safety_block(&mut self, payload: &[u8], safety: Option<&mut SafetyData>) {
        let Some(out) = safety else { return };
        if payload.len() != 8 {
            warn!("malformed safety block ({} bytes)", payload.len());
            self.last_errno = Error::InvalidResponse.code();
            return;
        }
        let received = std::str::from_utf8(&payload[4..])
            .ok()
            .and_then(|hex| u16::from_str_radix(hex, 16).ok())
            .unwrap_or(0);
        let computed = crc::checksum(&payload[..4]);
        let word = scip::decode(&payload[..4]);
        out.is_ossd1_1_on = word & 0x1 != 0;
        out.is_ossd1_2_on = word & 0x2 != 0;
        out.is_ossd2_1_on = word & 0x4 != 0;
        out.is_ossd2_2_on = word & 0x8 != 0;
        out.crc_valid = received == computed;
        if !out.crc_valid {
            warn!("safety block crc mismatch: received {received:04X}, computed {computed:04X}");
            self.last_errno = Error::Checksum.code();
        }
    }

    fn send_measurement_command(
        &mut self,
        scan_times: u32,
        skip_scan: u8,
        single: char,
        continuous: char,
        data_ch: char,
    ) -> UrgResult<()> {
        self.specified_scan_times = scan_times;
        self.remaining_scan_times = scan_times;
        self.scanning_skip_scan = skip_scan;

        let first = self.scanning_first_step + self.front_data_index;
        let last = self.scanning_last_step + self.front_data_index;
        let command = if scan_times == 1 {
            // One-shot commands measure with the laser already lit.
            self.laser_on()?;
            format!(
                "{single}{data_ch}{first:04}{last:04}{:02}\n",
                self.scanning_skip_step
            )
        } else {
            format!(
                "{continuous}{data_ch}{first:04}{last:04}{:02}{skip_scan:01}00\n",
                self.scanning_skip_step
            )
        };

        let written = self.conn.send(command.as_bytes()).unwrap_or(0);
        self.is_sending = true;
        if written != command.len() {
            return self.fail(Error::Send);
        }
        self.last_errno = 0;
        Ok(())
    }

    fn receive_measurement(
        &mut self,
        length: Option<&mut [u32]>,
        intensity: Option<&mut [u16]>,
        time_stamp: Option<&mut u32>,
        safety: Option<&mut SafetyData>,
    ) -> UrgResult<usize> {
        match self.receive_data(length, intensity, time_stamp, safety)? {
            Reply::Data(n) => Ok(n),
            Reply::Stopped => Ok(0),
        }
    }

    fn identity_token(
        &mut self,
        command: &str,
        min_lines: usize,
        key: &str,
        end: char,
    ) -> UrgResult<String> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        let mut capture = Vec::new();
        let ret = self.scip_response(command, &[0], self.timeout, Some(&mut capture))?;
        if ret < min_lines {
            return self.fail(Error::Receive);
        }
        for line in capture.iter().take(ret - 1) {
            if let Some(rest) = line.strip_prefix(key) {
                if let Some((value, _)) = rest.split_once(end) {
                    self.last_errno = 0;
                    return Ok(value.to_string());
                }
            }
        }
        self.fail(Error::Receive)
    }
}

// ======= External API =======
impl Urg {
    /// Ends any running stream and marks the session closed. Runs
    /// automatically when the session is dropped.
    pub fn close(&mut self) {
        if self.is_active {
            self.ignore_receive_data(self.timeout);
        }
        self.is_active = false;
    }

    /// Starts a measurement. `scan_times == 0` streams until
    /// [`stop_measurement`](Urg::stop_measurement); `skip_scan` keeps only
    /// every (n+1)-th scan of a continuous stream.
    pub fn start_measurement(
        &mut self,
        kind: MeasurementType,
        scan_times: u32,
        skip_scan: u8,
    ) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        if !SKIP_SCAN_BOUNDS.contains(&skip_scan) {
            return self.fail(Error::InvalidParameter);
        }

        let (single, continuous, data_ch) = match kind {
            MeasurementType::Distance => {
                let data_ch = match self.range_data_byte {
                    RangeDataByte::Two => 'S',
                    RangeDataByte::Three => 'D',
                };
                ('G', 'M', data_ch)
            }
            MeasurementType::DistanceIntensity => ('G', 'M', 'E'),
            MeasurementType::Multiecho => ('H', 'N', 'D'),
            MeasurementType::MultiechoIntensity => ('H', 'N', 'E'),
        };
        self.send_measurement_command(scan_times, skip_scan, single, continuous, data_ch)
    }

    /// Receives one distance frame. Returns the number of steps written
    /// into `data`, or 0 when the frame was the stream's stop echo.
    pub fn get_distance(
        &mut self,
        data: &mut [u32],
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), None, time_stamp, None)
    }

    /// Receives one distance+intensity frame.
    pub fn get_distance_intensity(
        &mut self,
        data: &mut [u32],
        intensity: &mut [u16],
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), Some(intensity), time_stamp, None)
    }

    /// Receives one multi-echo frame. `data` holds [`MAX_ECHO`] slots per
    /// step; absent echoes are zero.
    pub fn get_multiecho(
        &mut self,
        data: &mut [u32],
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), None, time_stamp, None)
    }

    /// Receives one multi-echo frame with intensities.
    pub fn get_multiecho_intensity(
        &mut self,
        data: &mut [u32],
        intensity: &mut [u16],
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), Some(intensity), time_stamp, None)
    }

    /// Terminates a running stream. In-flight frames are discarded until
    /// the sensor echoes the stop, up to three frames.
    pub fn stop_measurement(&mut self) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        let written = self.conn.send(b"QT\n").unwrap_or(0);
        if written != 3 {
            return self.fail(Error::Send);
        }
        for _ in 0..MAX_READ_TIMES {
            match self.receive_data(None, None, None, None) {
                Ok(Reply::Stopped) => {
                    self.is_sending = false;
                    self.is_laser_on = false;
                    self.last_errno = 0;
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
        }
        self.fail(Error::InvalidResponse)
    }

    /// Restricts the measured window. Steps are relative to the front of
    /// the sensor; `skip_step` merges that many adjacent steps into one
    /// reported sample.
    pub fn set_scanning_parameter(
        &mut self,
        first_step: i32,
        last_step: i32,
        skip_step: i32,
    ) -> UrgResult<()> {
        if !SKIP_STEP_BOUNDS.contains(&skip_step)
            || first_step > last_step
            || first_step < -self.front_data_index
            || last_step > self.last_data_index - self.front_data_index
        {
            return self.fail(Error::ScanningParameter);
        }
        self.scanning_first_step = first_step;
        self.scanning_last_step = last_step;
        self.scanning_skip_step = skip_step;
        self.last_errno = 0;
        Ok(())
    }

    /// Selects the wire width of plain distance samples. Two-byte
    /// encoding shortens frames but caps the range at 4095 [mm].
    pub fn set_connection_data_size(&mut self, data_byte: RangeDataByte) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.range_data_byte = data_byte;
        self.last_errno = 0;
        Ok(())
    }

    /// Lights the laser. Does nothing on the wire when it is already on.
    pub fn laser_on(&mut self) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        if self.is_laser_on {
            self.last_errno = 0;
            return Ok(());
        }
        // 02: the laser was already lit.
        self.scip_response("BM\n", &[0, 2], self.timeout, None)?;
        self.is_laser_on = true;
        self.last_errno = 0;
        Ok(())
    }

    /// Stops the laser; equivalent to stopping the measurement stream.
    pub fn laser_off(&mut self) -> UrgResult<()> {
        self.stop_measurement()
    }

    /// Enters time-stamp adjustment mode.
    pub fn start_time_stamp_mode(&mut self) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.scip_response("TM0\n", &[0], self.timeout, None)?;
        self.last_errno = 0;
        Ok(())
    }

    /// Reads one sample of the sensor's millisecond counter (21 bits,
    /// wraps at 2097152). The session must be in time-stamp mode.
    pub fn time_stamp(&mut self) -> UrgResult<u32> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        let mut capture = Vec::new();
        self.scip_response("TM1\n", &[0], self.timeout, Some(&mut capture))?;
        if capture.first().map(String::as_str) != Some("00P") {
            return self.fail(Error::Receive);
        }
        let line = capture.get(1).map(String::as_bytes).unwrap_or(b"");
        if line.len() != 5 {
            return self.fail(Error::Receive);
        }
        if line[4] != scip::checksum(&line[..4]) {
            return self.fail(Error::Checksum);
        }
        self.last_errno = 0;
        Ok(scip::decode(&line[..4]))
    }

    /// Leaves time-stamp adjustment mode.
    pub fn stop_time_stamp_mode(&mut self) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.scip_response("TM2\n", &[0], self.timeout, None)?;
        self.last_errno = 0;
        Ok(())
    }

    /// Reboots the sensor (two consecutive RB) and closes the session.
    pub fn reboot(&mut self) -> UrgResult<()> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        // The sensor only honours the second RB.
        for _ in 0..2 {
            match self.scip_response("RB\n", &[0, 1], self.timeout, None) {
                Ok(n) if n > 0 => {}
                _ => return self.fail(Error::InvalidResponse),
            }
        }
        self.close();
        self.last_errno = 0;
        Ok(())
    }

    /// Serial number, from the VV response.
    pub fn sensor_id(&mut self) -> UrgResult<String> {
        self.identity_token("VV\n", VV_RESPONSE_LINES, "SERI:", ';')
    }

    /// Firmware version, from the VV response.
    pub fn sensor_version(&mut self) -> UrgResult<String> {
        self.identity_token("VV\n", VV_RESPONSE_LINES, "FIRM:", '(')
    }

    /// Health status, from the II response.
    pub fn sensor_status(&mut self) -> UrgResult<String> {
        self.identity_token("II\n", II_RESPONSE_LINES, "STAT:", ';')
    }

    // --- safety-model variants ---

    /// Starts a measurement on a safety-model sensor; frames then carry
    /// the CRC-protected OSSD auxiliary block.
    pub fn safety_start_measurement(
        &mut self,
        kind: MeasurementType,
        scan_times: u32,
        skip_scan: u8,
    ) -> UrgResult<()> {
        self.safety_mode = true;
        self.start_measurement(kind, scan_times, skip_scan)
    }

    /// Receives one distance frame plus its OSSD states. A CRC mismatch
    /// keeps the frame's data but clears `safety.crc_valid` and records
    /// a checksum error as the session's last error.
    pub fn safety_get_distance(
        &mut self,
        data: &mut [u32],
        safety: &mut SafetyData,
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), None, time_stamp, Some(safety))
    }

    /// Receives one distance+intensity frame plus its OSSD states.
    pub fn safety_get_distance_intensity(
        &mut self,
        data: &mut [u32],
        intensity: &mut [u16],
        safety: &mut SafetyData,
        time_stamp: Option<&mut u32>,
    ) -> UrgResult<usize> {
        if !self.is_active {
            return self.fail(Error::NotConnected);
        }
        self.receive_measurement(Some(data), Some(intensity), time_stamp, Some(safety))
    }

    /// Terminates a safety-mode stream.
    pub fn safety_stop_measurement(&mut self) -> UrgResult<()> {
        let result = self.stop_measurement();
        self.safety_mode = false;
        result
    }

    // --- accessors and conversion helpers ---

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Samples one frame can carry at most with the widest window; size
    /// distance buffers with this (times [`MAX_ECHO`] for multi-echo).
    pub fn max_data_size(&self) -> usize {
        (self.last_data_index - self.first_data_index + 1).max(0) as usize
    }

    /// Measurable range in millimetres.
    pub fn distance_min_max(&self) -> (u32, u32) {
        (self.min_distance, self.max_distance)
    }

    /// Duration of one scan in microseconds.
    pub fn scan_usec(&self) -> u32 {
        self.scan_usec
    }

    /// Numeric code of the last error, 0 when the last call succeeded.
    pub fn error_code(&self) -> i32 {
        self.last_errno
    }

    /// Human-readable message for the last error.
    pub fn error(&self) -> &'static str {
        Error::message(self.last_errno)
    }

    /// Index into a result array for a front-relative step of the
    /// current scanning window.
    pub fn step_to_index(&self, step: i32) -> usize {
        ((step - self.scanning_first_step) / self.scanning_skip_step.max(1)).max(0) as usize
    }

    /// Front-relative step closest to an angle in degrees.
    pub fn deg_to_step(&self, degree: f64) -> i32 {
        (degree * self.area_resolution as f64 / 360.0).round() as i32
    }

    /// Angle of a front-relative step, in radians.
    pub fn step_to_rad(&self, step: i32) -> f64 {
        step as f64 * 2.0 * std::f64::consts::PI / self.area_resolution as f64
    }

    /// Angle of a result-array index, in radians.
    pub fn index_to_rad(&self, index: usize) -> f64 {
        self.step_to_rad(self.scanning_first_step + index as i32 * self.scanning_skip_step.max(1))
    }
}

impl Drop for Urg {
    fn drop(&mut self) {
        self.close();
    }
}

/// About four scan periods, and never less than one full scan.
fn derived_timeout(scan_usec: u32) -> Duration {
    Duration::from_millis(((scan_usec >> 8).max(scan_usec / 1000)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, mock::MockIo};
    use pretty_assertions::assert_eq;

    /// Appends the SCIP checksum and terminator to a payload.
    fn ck_line(payload: &str) -> String {
        format!("{}{}\n", payload, scip::checksum(payload.as_bytes()) as char)
    }

    fn encoded(value: u32, width: usize) -> String {
        String::from_utf8(scip::encode(value, width)).unwrap()
    }

    /// A data line of three-character samples.
    fn data_line(samples: &[u32]) -> String {
        let payload: String = samples.iter().map(|s| encoded(*s, 3)).collect();
        ck_line(&payload)
    }

    /// A full measurement frame: echoback, status, timestamp, data lines
    /// (already checksummed) and the terminating blank line.
    fn frame(echo: &str, status: &str, time_stamp: u32, data: &str) -> String {
        format!(
            "{echo}\n{}{}{data}\n",
            ck_line(status),
            ck_line(&encoded(time_stamp, 4))
        )
    }

    fn pp_response() -> String {
        let mut response = String::from("PP\n");
        response.push_str(&ck_line("00"));
        for kv in [
            "MODL:UTM-30LX;",
            "DMIN:20;",
            "DMAX:5600;",
            "ARES:1024;",
            "AMIN:44;",
            "AMAX:725;",
            "AFRT:384;",
            "SCAN:600;",
        ] {
            response.push_str(&ck_line(kv));
        }
        response.push('\n');
        response
    }

    fn bm_response() -> String {
        format!("BM\n{}\n", ck_line("00"))
    }

    fn open_serial(mock: &MockIo, baudrate: u32) -> UrgResult<Urg> {
        Urg::open_with(
            Box::new(Connection::new(mock.clone())),
            ConnectionKind::Serial,
            baudrate,
        )
    }

    fn open_ethernet(mock: &MockIo) -> Urg {
        mock.script_at(0, pp_response().as_bytes());
        Urg::open_with(
            Box::new(Connection::new(mock.clone())),
            ConnectionKind::Ethernet,
            0,
        )
        .unwrap()
    }

    #[test]
    fn ethernet_open_retrieves_parameters() {
        let mock = MockIo::default();
        let urg = open_ethernet(&mock);

        assert_eq!(mock.take_written(), "PP\n");
        assert_eq!(urg.scan_usec(), 100_000);
        assert_eq!(urg.front_data_index, 384);
        assert_eq!(urg.distance_min_max(), (20, 5600));
        assert_eq!(urg.timeout, Duration::from_millis(390));
        assert_eq!(
            (urg.scanning_first_step, urg.scanning_last_step),
            (-340, 341)
        );
        assert_eq!(urg.max_data_size(), 682);
        assert!(urg.is_active());
    }

    #[test]
    fn serial_open_at_requested_baudrate() {
        let mock = MockIo::default();
        mock.script_at(115_200, format!("QT\n{}\n", ck_line("00")).as_bytes());
        mock.script_on(b"PP\n", 115_200, pp_response().as_bytes());

        let urg = open_serial(&mock, 115_200).unwrap();
        // Already at the requested rate: no SS exchange.
        assert_eq!(mock.written(), "QT\nPP\n");
        assert_eq!(mock.baudrate(), 115_200);
        assert!(urg.is_active());
    }

    #[test]
    fn serial_open_upgrades_scip11_sensor() {
        let mock = MockIo::default();
        // SCIP 1.1 sensors answer QT with a bare "E" status.
        mock.script_at(19_200, b"QT\nE\n\nSCIP2.0\n0\n\n");
        mock.script_on(
            b"SS115200\n",
            19_200,
            format!("SS115200\n{}\n", ck_line("00")).as_bytes(),
        );
        mock.script_on(b"PP\n", 115_200, pp_response().as_bytes());

        let urg = open_serial(&mock, 115_200).unwrap();
        let written = mock.written();
        assert!(written.contains("SCIP2.0\n"));
        assert!(written.contains("SS115200\n"));
        assert_eq!(mock.baudrate(), 115_200);
        assert!(urg.is_active());
    }

    #[test]
    fn serial_open_leaves_time_stamp_mode() {
        let mock = MockIo::default();
        mock.script_at(
            19_200,
            format!("QT\n{}\nTM2\n{}\n", ck_line("0E"), ck_line("00")).as_bytes(),
        );
        mock.script_on(b"PP\n", 19_200, pp_response().as_bytes());

        let urg = open_serial(&mock, 19_200).unwrap();
        assert!(mock.written().contains("TM2\n"));
        assert_eq!(mock.baudrate(), 19_200);
        assert!(urg.is_active());
    }

    #[test]
    fn serial_open_fails_when_sensor_is_silent() {
        let mock = MockIo::default();
        let err = open_serial(&mock, 115_200).unwrap_err();
        assert!(matches!(err, Error::BaudrateNotDetected));
        assert_eq!(err.code(), -10);
        // All three candidate rates were probed.
        assert_eq!(mock.written(), "QT\nQT\nQT\n");
    }

    #[test]
    fn single_shot_distance() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(-384, 340, 0).unwrap();
        mock.take_written();

        mock.script_at(0, bm_response().as_bytes());
        mock.script_on(
            b"GD0000072400\n",
            0,
            frame("GD0000072400", "00", 12345, &data_line(&[44, 45, 46])).as_bytes(),
        );

        urg.start_measurement(MeasurementType::Distance, 1, 0).unwrap();
        let mut data = vec![0u32; 725];
        let mut time_stamp = 0u32;
        let n = urg.get_distance(&mut data, Some(&mut time_stamp)).unwrap();

        assert_eq!(n, 3);
        assert_eq!(&data[..3], &[44, 45, 46]);
        assert_eq!(time_stamp, 12345);
        // One-shot: laser forced on first, and the request is terminated
        // once its single frame is in.
        assert_eq!(mock.written(), "BM\nGD0000072400\nQT\n");
    }

    #[test]
    fn skip_step_reduces_sample_count() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(0, 4, 2).unwrap();
        mock.script_at(0, bm_response().as_bytes());
        mock.script_on(
            b"GD0384038802\n",
            0,
            frame("GD0384038802", "00", 0, &data_line(&[100, 101, 102])).as_bytes(),
        );

        urg.start_measurement(MeasurementType::Distance, 1, 0).unwrap();
        let mut data = vec![0u32; 8];
        // Five steps at every second step: ceil(5 / 2) samples.
        assert_eq!(urg.get_distance(&mut data, None).unwrap(), 3);
    }

    #[test]
    fn two_byte_samples_decode_with_short_width() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_connection_data_size(RangeDataByte::Two).unwrap();
        urg.set_scanning_parameter(0, 0, 0).unwrap();
        mock.script_at(0, bm_response().as_bytes());
        mock.script_on(
            b"GS0384038400\n",
            0,
            frame("GS0384038400", "00", 0, &ck_line(&encoded(1234, 2))).as_bytes(),
        );

        urg.start_measurement(MeasurementType::Distance, 1, 0).unwrap();
        let mut data = vec![0u32; 1];
        assert_eq!(urg.get_distance(&mut data, None).unwrap(), 1);
        assert_eq!(data[0], 1234);
    }

    #[test]
    fn multiecho_demultiplexes_ampersand_samples() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(-384, -383, 0).unwrap();
        mock.script_at(0, bm_response().as_bytes());
        mock.script_on(
            b"HD0000000100\n",
            0,
            frame("HD0000000100", "00", 0, &ck_line("aaa&bbb&cccddd")).as_bytes(),
        );

        urg.start_measurement(MeasurementType::Multiecho, 1, 0).unwrap();
        let mut data = vec![9u32; 6];
        let n = urg.get_multiecho(&mut data, None).unwrap();

        assert_eq!(n, 2);
        assert_eq!(
            data,
            vec![
                scip::decode(b"aaa"),
                scip::decode(b"bbb"),
                scip::decode(b"ccc"),
                scip::decode(b"ddd"),
                0,
                0,
            ]
        );
    }

    #[test]
    fn multiecho_intensity_pairs_and_zero_fills() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(0, 0, 0).unwrap();
        mock.script_at(0, bm_response().as_bytes());
        let payload = format!(
            "{}{}&{}{}",
            encoded(500, 3),
            encoded(10, 3),
            encoded(501, 3),
            encoded(11, 3)
        );
        mock.script_on(
            b"HE0384038400\n",
            0,
            frame("HE0384038400", "00", 0, &ck_line(&payload)).as_bytes(),
        );

        urg.start_measurement(MeasurementType::MultiechoIntensity, 1, 0)
            .unwrap();
        let mut data = vec![9u32; 3];
        let mut intensity = vec![9u16; 3];
        let n = urg
            .get_multiecho_intensity(&mut data, &mut intensity, None)
            .unwrap();

        assert_eq!(n, 1);
        assert_eq!(data, vec![500, 501, 0]);
        assert_eq!(intensity, vec![10, 11, 0]);
    }

    #[test]
    fn distance_intensity_interleaves_pairs() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(0, 1, 0).unwrap();
        mock.script_at(0, bm_response().as_bytes());
        let payload = format!(
            "{}{}{}{}",
            encoded(100, 3),
            encoded(7, 3),
            encoded(101, 3),
            encoded(8, 3)
        );
        mock.script_on(
            b"GE0384038500\n",
            0,
            frame("GE0384038500", "00", 0, &ck_line(&payload)).as_bytes(),
        );

        urg.start_measurement(MeasurementType::DistanceIntensity, 1, 0)
            .unwrap();
        let mut data = vec![0u32; 2];
        let mut intensity = vec![0u16; 2];
        let n = urg
            .get_distance_intensity(&mut data, &mut intensity, None)
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(data, vec![100, 101]);
        assert_eq!(intensity, vec![7, 8]);
    }

    #[test]
    fn continuous_stream_stops_on_request() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();

        let echo = "MD0044072501000";
        let data_frame = |ts: u32, values: &[u32]| frame(echo, "99", ts, &data_line(values));
        let mut stream = format!("{echo}\n{}\n", ck_line("00"));
        stream.push_str(&data_frame(10, &[100, 101]));
        stream.push_str(&data_frame(35, &[102, 103]));
        mock.script_on(b"MD0044072501000\n", 0, stream.as_bytes());
        // One frame still in flight when the stop goes out.
        let mut tail = data_frame(60, &[104, 105]);
        tail.push_str(&format!("QT\n{}\n", ck_line("00")));
        mock.script_on(b"QT\n", 0, tail.as_bytes());

        urg.start_measurement(MeasurementType::Distance, 0, 0).unwrap();
        let mut data = vec![0u32; 725];
        let mut time_stamp = 0u32;
        // The first get consumes the acknowledgement frame transparently.
        assert_eq!(
            urg.get_distance(&mut data, Some(&mut time_stamp)).unwrap(),
            2
        );
        assert_eq!(&data[..2], &[100, 101]);
        assert_eq!(time_stamp, 10);
        assert_eq!(urg.get_distance(&mut data, None).unwrap(), 2);
        assert_eq!(&data[..2], &[102, 103]);

        urg.stop_measurement().unwrap();
        assert!(!urg.is_sending);
        assert_eq!(urg.error_code(), 0);
        assert_eq!(mock.remaining_script(), 0);

        // The stream is down: a new request goes out on a clean line.
        urg.start_measurement(MeasurementType::Distance, 0, 0).unwrap();
    }

    #[test]
    fn bounded_stream_terminates_itself() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();

        let echo = "MD0044072501000";
        let data_frame = |ts: u32, values: &[u32]| frame(echo, "99", ts, &data_line(values));
        let mut stream = format!("{echo}\n{}\n", ck_line("00"));
        stream.push_str(&data_frame(10, &[100]));
        stream.push_str(&data_frame(35, &[101]));
        mock.script_on(b"MD0044072501000\n", 0, stream.as_bytes());
        // The engine's own QT after the last scan; its acknowledgement is
        // what the explicit stop call then reads.
        mock.script_on(b"QT\n", 0, format!("QT\n{}\n", ck_line("00")).as_bytes());

        urg.start_measurement(MeasurementType::Distance, 2, 0).unwrap();
        let mut data = vec![0u32; 725];
        assert_eq!(urg.get_distance(&mut data, None).unwrap(), 1);
        assert_eq!(urg.remaining_scan_times, 1);
        assert_eq!(urg.get_distance(&mut data, None).unwrap(), 1);
        assert_eq!(urg.remaining_scan_times, 0);
        assert!(mock.written().ends_with("QT\n"));

        urg.stop_measurement().unwrap();
        assert!(!urg.is_sending);
    }

    #[test]
    fn laser_on_is_idempotent() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();
        mock.script_at(0, bm_response().as_bytes());

        urg.laser_on().unwrap();
        urg.laser_on().unwrap();
        assert_eq!(mock.written(), "BM\n");
    }

    #[test]
    fn scanning_parameters_are_validated_without_io() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();

        for (first, last, skip) in [(10, 5, 1), (-385, 0, 1), (0, 342, 1), (0, 100, 100)] {
            let err = urg.set_scanning_parameter(first, last, skip).unwrap_err();
            assert!(matches!(err, Error::ScanningParameter));
        }
        assert_eq!(urg.error_code(), -13);
        assert_eq!(urg.error(), "scanning parameter out of range");

        urg.set_scanning_parameter(-90, 90, 2).unwrap();
        assert_eq!(urg.error(), "no error");
        assert_eq!(mock.written(), "");
    }

    #[test]
    fn skip_scan_is_validated_without_io() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();

        let err = urg
            .start_measurement(MeasurementType::Distance, 0, 10)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter));
        assert_eq!(mock.written(), "");
    }

    #[test]
    fn time_stamp_mode_round_trip() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        let mut script = format!("TM0\n{}\n", ck_line("00"));
        script.push_str(&format!(
            "TM1\n{}{}\n",
            ck_line("00"),
            ck_line(&encoded(987_654, 4))
        ));
        script.push_str(&format!("TM2\n{}\n", ck_line("00")));
        mock.script_at(0, script.as_bytes());

        urg.start_time_stamp_mode().unwrap();
        assert_eq!(urg.time_stamp().unwrap(), 987_654);
        urg.stop_time_stamp_mode().unwrap();
    }

    #[test]
    fn identity_tokens_are_extracted() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);

        let vv = {
            let mut s = String::from("VV\n");
            s.push_str(&ck_line("00"));
            for kv in [
                "VEND:Hokuyo Automatic Co., Ltd.;",
                "PROD:SOKUIKI Sensor UTM-30LX;",
                "FIRM:1.20(16/Apr/2013);",
                "PROT:SCIP 2.0;",
                "SERI:H1310971;",
            ] {
                s.push_str(&ck_line(kv));
            }
            s.push('\n');
            s
        };
        let ii = {
            let mut s = String::from("II\n");
            s.push_str(&ck_line("00"));
            for kv in [
                "MODL:UTM-30LX;",
                "LASR:ON;",
                "SCSP:2400;",
                "MESM:Idle;",
                "SBPS:USB full speed;",
                "TIME:0C6BC;",
                "STAT:sensor is working normally.;",
                "MESA:(none);",
            ] {
                s.push_str(&ck_line(kv));
            }
            s.push('\n');
            s
        };
        mock.script_at(0, vv.as_bytes());
        mock.script_at(0, vv.as_bytes());
        mock.script_at(0, ii.as_bytes());

        assert_eq!(urg.sensor_id().unwrap(), "H1310971");
        assert_eq!(urg.sensor_version().unwrap(), "1.20");
        assert_eq!(urg.sensor_status().unwrap(), "sensor is working normally.");
    }

    #[test]
    fn safety_frames_carry_crc_checked_ossd_states() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        urg.set_scanning_parameter(0, 1, 0).unwrap();
        mock.take_written();

        let aux_line = |word: u32, crc: u16| {
            let payload = format!("{}{crc:04X}", encoded(word, 4));
            ck_line(&payload)
        };
        // OSSD1_1 and OSSD2_1 asserted.
        let word = 0b0101;
        let good_crc = crc::checksum(&scip::encode(word, 4));

        let echo = "MD0384038500000";
        let mut stream = format!("{echo}\n{}\n", ck_line("00"));
        stream.push_str(&frame(
            echo,
            "99",
            0,
            &format!("{}{}", data_line(&[1000, 1001]), aux_line(word, good_crc)),
        ));
        stream.push_str(&frame(
            echo,
            "99",
            0,
            &format!("{}{}", data_line(&[1000, 1001]), aux_line(word, !good_crc)),
        ));
        mock.script_on(b"MD0384038500000\n", 0, stream.as_bytes());
        mock.script_on(b"QT\n", 0, format!("QT\n{}\n", ck_line("00")).as_bytes());

        urg.safety_start_measurement(MeasurementType::Distance, 0, 0)
            .unwrap();
        let mut data = vec![0u32; 2];
        let mut safety = SafetyData::default();

        assert_eq!(
            urg.safety_get_distance(&mut data, &mut safety, None).unwrap(),
            2
        );
        assert_eq!(data, vec![1000, 1001]);
        assert!(safety.is_ossd1_1_on);
        assert!(!safety.is_ossd1_2_on);
        assert!(safety.is_ossd2_1_on);
        assert!(!safety.is_ossd2_2_on);
        assert!(safety.crc_valid);
        assert_eq!(urg.error_code(), 0);

        // Corrupted CRC: the data is still handed over, the mismatch is
        // recorded on the session.
        assert_eq!(
            urg.safety_get_distance(&mut data, &mut safety, None).unwrap(),
            2
        );
        assert!(!safety.crc_valid);
        assert_eq!(urg.error_code(), -8);

        urg.safety_stop_measurement().unwrap();
        assert!(!urg.safety_mode);
    }

    #[test]
    fn checksum_error_drains_and_session_recovers() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();
        mock.script_at(0, bm_response().as_bytes());
        // Data line whose checksum byte is wrong.
        let bad = format!(
            "GD0044072501\n{}{}000!\n\n",
            ck_line("00"),
            ck_line(&encoded(0, 4))
        );
        mock.script_on(b"GD0044072501\n", 0, bad.as_bytes());

        urg.start_measurement(MeasurementType::Distance, 1, 0).unwrap();
        let mut data = vec![0u32; 725];
        let err = urg.get_distance(&mut data, None).unwrap_err();
        assert!(matches!(err, Error::Checksum));
        assert_eq!(urg.error_code(), -8);

        // The drain left the line clean; the next command works.
        mock.script_at(0, bm_response().as_bytes());
        urg.laser_on().unwrap();
    }

    #[test]
    fn reboot_closes_the_session() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);
        mock.take_written();
        mock.script_at(
            0,
            format!("RB\n{}\nRB\n{}\n", ck_line("00"), ck_line("00")).as_bytes(),
        );

        urg.reboot().unwrap();
        assert!(!urg.is_active());
        assert!(mock.written().starts_with("RB\nRB\n"));

        let err = urg.laser_on().unwrap_err();
        assert_eq!(err.code(), -2);
        assert_eq!(urg.error(), "not connected");
    }

    #[test]
    fn step_index_and_angle_helpers() {
        let mock = MockIo::default();
        let mut urg = open_ethernet(&mock);

        assert_eq!(urg.step_to_index(0), 340);
        assert_eq!(urg.deg_to_step(90.0), 256);
        assert!((urg.step_to_rad(256) - std::f64::consts::FRAC_PI_2).abs() < 1e-9);

        urg.set_scanning_parameter(-90, 90, 2).unwrap();
        assert_eq!(urg.step_to_index(-90), 0);
        assert_eq!(urg.step_to_index(0), 45);
        assert!((urg.index_to_rad(45) - 0.0).abs() < 1e-9);
    }
}
