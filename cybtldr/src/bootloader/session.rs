//! Session orchestration: enter, process every row, verify, exit.

use crate::{
    bootloader::{Action, Bootloader, Progress, SessionState},
    error::{BootloaderStatus, Error, ErrorCode, Result},
    image::cyacd::{
        FirmwareImage, Line, META_PREFIX, ROW_PREFIX, detect_file_version, parse_eiv, parse_header,
        parse_header_v1, parse_row, parse_row_v1,
    },
    protocol::command::SecurityKey,
    transport::Transport,
};
use log::{debug, info, warn};

/// Highest application slot of a multi-application bootloader (zero-based).
const MAX_APP_ID: u8 = 1;

impl<T: Transport> Bootloader<T> {
    /// Program every row of `image` and verify it.
    ///
    /// `app_id` selects the target slot of a dual-application bootloader
    /// (1 or 2); any other value programs a single-application bootloader.
    pub fn program(
        &mut self,
        image: &FirmwareImage,
        key: Option<&SecurityKey>,
        app_id: u8,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        self.run_action(Action::Program, image, key, app_id, progress)
    }

    /// Erase every row of `image`.
    pub fn erase(
        &mut self,
        image: &FirmwareImage,
        key: Option<&SecurityKey>,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        self.run_action(Action::Erase, image, key, 0, progress)
    }

    /// Compare every row of `image` with the device.
    pub fn verify(
        &mut self,
        image: &FirmwareImage,
        key: Option<&SecurityKey>,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        self.run_action(Action::Verify, image, key, 0, progress)
    }

    /// Run `action` over `image`.
    ///
    /// The image format decides the command set. The transport is closed
    /// when the session ends, whatever the outcome.
    pub fn run_action(
        &mut self,
        action: Action,
        image: &FirmwareImage,
        key: Option<&SecurityKey>,
        app_id: u8,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        let header = image.header_line()?;
        let version = detect_file_version(image.name(), header.text)?;
        info!("Starting {action} of {} (format {version})", image.name());

        let result = match version {
            0 => self.run_v0(action, image, header, key, app_id, progress),
            1 => self.run_v1(action, image, header, progress),
            other => Err(Error::Unsupported(format!("image format version {other}"))),
        };

        if let Err(e) = self.transport.close() {
            warn!("Failed to close transport: {e}");
        }
        self.state = SessionState::Idle;

        match &result {
            Ok(()) => info!("{action} of {} finished", image.name()),
            Err(e) => info!("{action} of {} failed: {e} (code {:#06x})", image.name(), e.code()),
        }
        result
    }

    fn run_v0(
        &mut self,
        action: Action,
        image: &FirmwareImage,
        header: Line<'_>,
        key: Option<&SecurityKey>,
        app_id: u8,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        let parsed = parse_header(header.text)?;
        self.checksum = parsed.checksum();
        self.state = SessionState::Open;

        // Slots are numbered from 1 on the command line, from 0 on the device.
        let app = app_id
            .checked_sub(1)
            .filter(|id| *id <= MAX_APP_ID);

        let result = self
            .start_bootload(parsed.silicon_id, parsed.silicon_rev, key)
            .and_then(|_| match app {
                Some(app) => self.check_app_inactive(action, app),
                None => Ok(()),
            })
            .and_then(|()| {
                self.process_lines(action, image, header.index + 1, progress, |bl, text| {
                    bl.process_row_v0(action, text)
                })
            });

        self.close_session(result, |bl| match (action, app) {
            (Action::Program, Some(app)) => bl.activate_app(app),
            (Action::Program | Action::Verify, _) => bl.verify_application(),
            (Action::Erase, _) => Ok(()),
        })
    }

    fn run_v1(
        &mut self,
        action: Action,
        image: &FirmwareImage,
        header: Line<'_>,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        let parsed = parse_header_v1(header.text)?;
        self.checksum = parsed.checksum();
        self.state = SessionState::Open;

        let first_row = header.index + 1;
        let result = self
            .start_bootload_v1(parsed.silicon_id, parsed.silicon_rev, parsed.product_id)
            .and_then(|_| image.app_info(first_row))
            .and_then(|app| self.set_app_metadata(parsed.app_id, app.start, app.size))
            .and_then(|()| {
                self.process_lines(action, image, first_row, progress, |bl, text| {
                    bl.process_line_v1(action, text)
                })
            });

        self.close_session(result, |bl| match action {
            Action::Program | Action::Verify => bl.verify_application_v1(parsed.app_id),
            Action::Erase => Ok(()),
        })
    }

    /// Refuse to modify the active application of a multi-application
    /// bootloader.
    fn check_app_inactive(&mut self, action: Action, app: u8) -> Result<()> {
        match self.get_app_status(app) {
            Ok(status) if status.is_active && action != Action::Verify => {
                Err(Error::ApplicationActive(app))
            },
            Ok(_) => Ok(()),
            Err(e) if e.is_status(BootloaderStatus::Cmd) => {
                debug!("Single-application bootloader");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Make a freshly programmed application the active one.
    fn activate_app(&mut self, app: u8) -> Result<()> {
        match self.get_app_status(app) {
            Ok(status) if status.is_valid() => self.set_active_app(app),
            Ok(_) => Err(Error::InvalidApplication),
            Err(e) if e.is_status(BootloaderStatus::Cmd) => {
                debug!("Single-application bootloader");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    fn process_lines(
        &mut self,
        action: Action,
        image: &FirmwareImage,
        start: usize,
        progress: &mut dyn FnMut(&Progress),
        mut process: impl FnMut(&mut Self, &str) -> Result<()>,
    ) -> Result<()> {
        self.state = SessionState::RowLoop;
        let total_lines = image.line_count();
        let mut next = start;
        let mut rows = 0;

        loop {
            if self.abort.is_aborted() {
                info!("Abort requested after {rows} row(s)");
                return Err(Error::Aborted);
            }

            let Some(line) = image.read_line(next) else {
                return Ok(());
            };
            next = line.index + 1;

            process(self, line.text)?;
            rows += 1;
            progress(&Progress {
                action,
                line: line.index + 1,
                total_lines,
                rows,
            });
        }
    }

    fn process_row_v0(&mut self, action: Action, text: &str) -> Result<()> {
        let row = parse_row(text)?;

        match action {
            Action::Erase => return self.erase_row(row.array_id, row.row_num),
            Action::Program => self.program_row(row.array_id, row.row_num, &row.data)?,
            Action::Verify => {},
        }
        self.verify_row(row.array_id, row.row_num, row.expected_device_checksum())
    }

    fn process_line_v1(&mut self, action: Action, text: &str) -> Result<()> {
        if text.starts_with(ROW_PREFIX) {
            let row = parse_row_v1(text)?;
            match action {
                Action::Erase => self.erase_data(row.address),
                Action::Program => self.program_data(row.address, &row.data),
                Action::Verify => self.verify_data(row.address, &row.data),
            }
        } else if text.starts_with(META_PREFIX) {
            match parse_eiv(text) {
                Some(iv) => self.set_encryption_iv(&iv?),
                None => {
                    debug!("Skipping metadata line {text}");
                    Ok(())
                },
            }
        } else {
            Err(Error::image(
                ErrorCode::File,
                format!("unexpected line: {text}"),
            ))
        }
    }

    /// Finish a session: run `on_success` and exit after a clean row loop,
    /// exit after other failures unless the link itself failed.
    fn close_session(
        &mut self,
        result: Result<()>,
        on_success: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.state = SessionState::Closing;
        match result {
            Ok(()) => {
                let result = on_success(self);
                self.end_session();
                result
            },
            Err(e) => {
                if !e.is_comm() {
                    self.end_session();
                }
                Err(e)
            },
        }
    }
}
