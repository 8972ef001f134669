fn main() {
    download_organizer::run()
}
